// ============================================================================
// src/sbp2/packet_pool.rs - Request Packet Pool
// ============================================================================
//!
//! # 要求パケットプール
//!
//! ORB_POINTER / DOORBELL / AGENT_RESET への短い書き込み用に、
//! アダプタ毎に固定数のパケットを事前確保する。発行パスでは
//! アロケーションせず、枯渇時は `PoolError::Busy` でバックプレッシャーをかける。
//!
//! パケットはポスト書き込みの完了通知 (`PacketCompletion`) で返却される。

use alloc::vec::Vec;
#[cfg(feature = "stats")]
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::bus::PacketCompletion;
use crate::error::{BusError, PoolError};

/// パケットのペイロード上限（ORB_POINTER の8バイト）
pub const PACKET_PAYLOAD_MAX: usize = 8;

/// 再利用可能なバストランザクションバッファ
#[derive(Debug, PartialEq, Eq)]
pub struct RequestPacket {
    index: u16,
    len: u8,
    payload: [u8; PACKET_PAYLOAD_MAX],
}

impl RequestPacket {
    fn new(index: u16) -> Self {
        Self { index, len: 0, payload: [0; PACKET_PAYLOAD_MAX] }
    }

    /// プール内のインデックス
    pub fn index(&self) -> u16 {
        self.index
    }

    /// ペイロードを設定（上限を超える分は切り捨て）
    pub fn fill(&mut self, data: &[u8]) {
        let len = data.len().min(PACKET_PAYLOAD_MAX);
        self.payload[..len].copy_from_slice(&data[..len]);
        self.len = len as u8;
    }

    /// 書き込むバイト列
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }
}

/// 要求パケットプール
pub struct RequestPacketPool {
    free: Mutex<Vec<RequestPacket>>,
    capacity: usize,
    #[cfg(feature = "stats")]
    exhausted: AtomicU64,
}

impl RequestPacketPool {
    /// `capacity` 個のパケットを確保する
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for i in (0..capacity).rev() {
            free.push(RequestPacket::new(i as u16));
        }
        Self {
            free: Mutex::new(free),
            capacity,
            #[cfg(feature = "stats")]
            exhausted: AtomicU64::new(0),
        }
    }

    /// 空きパケットを借りる
    pub fn acquire(&self) -> Result<RequestPacket, PoolError> {
        match self.free.lock().pop() {
            Some(packet) => Ok(packet),
            None => {
                #[cfg(feature = "stats")]
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Busy)
            }
        }
    }

    /// ペイロード付きで借りる
    pub fn acquire_with(&self, data: &[u8]) -> Result<RequestPacket, PoolError> {
        let mut packet = self.acquire()?;
        packet.fill(data);
        Ok(packet)
    }

    /// パケットを返却する
    pub fn release(&self, mut packet: RequestPacket) {
        packet.len = 0;
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "request packet released twice");
        free.push(packet);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(feature = "stats")]
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

impl PacketCompletion for RequestPacketPool {
    fn posted_write_done(&self, packet: RequestPacket, result: Result<(), BusError>) {
        if let Err(e) = result {
            log::warn!("[SBP2] posted write (packet {}) failed: {}", packet.index(), e);
        }
        self.release(packet);
    }
}
