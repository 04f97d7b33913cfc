// ============================================================================
// src/bus.rs - Bus Transaction Layer Interface
// ============================================================================
//!
//! # バストランザクション層インターフェース
//!
//! パケットの送受信、ノード列挙、世代番号、バスリセット通知は
//! 外部のバスドライバが提供する。このモジュールはその境界だけを定義する。
//!
//! ## 非同期モデル
//! - `read` / `write`: ワーカータスクから `await` する（ログイン等）
//! - `post_write`: 発行パス/完了ルータから使う投げっぱなし書き込み。
//!   トランザクション完了時に `PacketCompletion` が一度だけ呼ばれる。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::pin::Pin;

use crate::error::BusError;
use crate::sbp2::packet_pool::RequestPacket;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// ノードID (型安全)
///
/// 上位10ビットがバスID、下位6ビットが物理ID。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u16);

impl NodeId {
    /// ローカルバスを示すバスID
    pub const LOCAL_BUS: u16 = 0x3FF;

    /// ローカルバス上の物理IDからノードIDを作成
    pub fn local(phy_id: u8) -> Self {
        Self((Self::LOCAL_BUS << 6) | (phy_id as u16 & 0x3F))
    }

    pub fn phy_id(&self) -> u8 {
        (self.0 & 0x3F) as u8
    }

    pub fn bus_id(&self) -> u16 {
        self.0 >> 6
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:#06x})", self.0)
    }
}

/// バス世代番号（バスリセット毎に進む）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u32);

/// バス速度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BusSpeed {
    /// 100 Mbps
    S100 = 0,
    /// 200 Mbps
    S200 = 1,
    /// 400 Mbps
    S400 = 2,
    /// 800 Mbps
    S800 = 3,
}

impl BusSpeed {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::S100,
            1 => Self::S200,
            2 => Self::S400,
            _ => Self::S800,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// この速度で許される最大ペイロード（ORBのmax_payloadエンコーディング）
    ///
    /// バイト数は `1 << (code + 2)`。S100で512バイト。
    pub fn max_payload_code(&self) -> u8 {
        7 + self.code()
    }
}

/// ステータス受信用に予約するホストアドレス範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRange {
    /// 48ビットのホストアドレス
    pub base: u64,
    /// 長さ（バイト）
    pub len: u32,
}

impl StatusRange {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.len as u64
    }
}

// ============================================================================
// Callbacks from the Bus Layer
// ============================================================================

/// デバイスからのステータス書き込みを受け取るシンク
///
/// バス層の非同期配送コンテキストから呼ばれる。スリープ禁止。
pub trait StatusSink: Send + Sync {
    /// `range` 内への書き込みを受け取る
    fn status_write(&self, source: NodeId, data: &[u8]);
}

/// バスリセット通知の受け取り手
pub trait BusResetListener: Send + Sync {
    /// 新しい世代でトポロジが確定した
    fn bus_reset(&self, generation: Generation);
}

/// 投げっぱなし書き込みの完了通知
///
/// パケットは必ずここで返却される（プールへの返却はこの副作用）。
pub trait PacketCompletion: Send + Sync {
    fn posted_write_done(&self, packet: RequestPacket, result: Result<(), BusError>);
}

/// バス操作のFuture
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

// ============================================================================
// Bus Transport Trait
// ============================================================================

/// バストランザクション層
pub trait BusTransport: Send + Sync {
    /// ローカル（ホストアダプタ自身）のノードID
    fn local_node(&self) -> NodeId;

    /// ローカルバス上のノード数（物理ID 0..count）
    fn node_count(&self) -> u8;

    /// 現在の世代番号
    fn current_generation(&self) -> Generation;

    /// ホストとノード間の経路速度
    fn node_speed(&self, node: NodeId) -> BusSpeed;

    /// アダプタ自身のmax_rec（バス情報ブロックのエンコーディング）
    fn max_rec(&self) -> u8;

    /// 非同期読み取り
    fn read(&self, node: NodeId, generation: Generation, address: u64, len: usize) -> BusFuture<'_, Vec<u8>>;

    /// 非同期書き込み（応答を待つ）
    fn write<'a>(&'a self, node: NodeId, generation: Generation, address: u64, data: &'a [u8]) -> BusFuture<'a, ()>;

    /// 投げっぱなし書き込み
    ///
    /// 即時失敗の場合も `done` は必ず一度呼ばれる。
    fn post_write(
        &self,
        node: NodeId,
        generation: Generation,
        address: u64,
        packet: RequestPacket,
        done: Arc<dyn PacketCompletion>,
    );

    /// ステータス受信範囲を登録
    fn register_status_sink(&self, range: StatusRange, sink: Arc<dyn StatusSink>) -> Result<(), BusError>;

    /// ステータス受信範囲を解除
    fn unregister_status_sink(&self, range: StatusRange);

    /// バスリセット通知を購読
    fn on_bus_reset(&self, listener: Arc<dyn BusResetListener>);

    /// バスリセットを発行
    fn reset_bus(&self) -> Result<(), BusError>;
}

// ============================================================================
// Bounded Retries
// ============================================================================

/// 応答なしに限り `retries` 回まで再試行する読み取り
///
/// 世代不一致などは即座に返す（再試行しても成功しない）。
pub async fn read_with_retries(
    bus: &dyn BusTransport,
    node: NodeId,
    generation: Generation,
    address: u64,
    len: usize,
    retries: u32,
) -> Result<Vec<u8>, BusError> {
    let mut attempt = 0;
    loop {
        match bus.read(node, generation, address, len).await {
            Err(BusError::Timeout) if attempt < retries => attempt += 1,
            other => return other,
        }
    }
}

/// 応答なしに限り `retries` 回まで再試行する書き込み
pub async fn write_with_retries(
    bus: &dyn BusTransport,
    node: NodeId,
    generation: Generation,
    address: u64,
    data: &[u8],
    retries: u32,
) -> Result<(), BusError> {
    let mut attempt = 0;
    loop {
        match bus.write(node, generation, address, data).await {
            Err(BusError::Timeout) if attempt < retries => attempt += 1,
            other => return other,
        }
    }
}
