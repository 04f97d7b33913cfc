// ============================================================================
// src/sbp2/session.rs - Device Sessions
// ============================================================================
//!
//! # セッション状態機械
//!
//! ```text
//! Unknown -> LoggingIn -> Active -> Reconnecting -> Active
//!                │          │            │
//!                v          v            └-> LoggingIn（再接続失敗時の新規ログイン）
//!              Failed    LoggingOut -> Closed
//! ```
//! `Failed` は終端。`Closed` へはどの状態からも解体で遷移する。
//!
//! 管理ORB（ログイン/再接続/ログアウト）はワーカータスクから発行し、
//! 管理ステータスは完了ルータがメールボックスに置く。

use alloc::sync::Arc;
use core::sync::atomic::{Ordering, fence};

use spin::Mutex;

use super::config_rom::{LogicalUnit, UnitInfo};
use super::defs;
use super::orb::{LoginIdOrb, LoginOrb, LoginResponse, OrbPointer, max_payload_code};
use super::orb_pool::OrbPool;
use super::quirks::Quirks;
use super::status::{Response, StatusBlock};
use crate::bus::{BusSpeed, BusTransport, Generation, NodeId, write_with_retries};
use crate::dma::{DmaPlatform, DmaRegion};
use crate::error::{DmaError, SessionError};
use crate::time::{Timer, WaitOutcome, wait_until};

// ============================================================================
// Handles and States
// ============================================================================

/// 世代チェック付きセッションハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub slot: u16,
    pub generation: u32,
}

/// セッション状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    LoggingIn,
    Active,
    Reconnecting,
    LoggingOut,
    Closed,
    Failed,
}

impl SessionState {
    /// 遷移が許されるか
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (*self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Unknown, LoggingIn) => true,
            (LoggingIn, Active) | (LoggingIn, Failed) => true,
            (Active, Reconnecting) | (Active, LoggingOut) => true,
            (Reconnecting, Active) | (Reconnecting, Failed) | (Reconnecting, LoggingIn) => true,
            _ => false,
        }
    }

    /// コマンドを発行できる状態か
    pub fn accepts_commands(&self) -> bool {
        matches!(self, SessionState::Active)
    }
}

/// 走査中の確認マーク
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// 走査開始時にクリアされた
    Stale,
    /// この走査で再確認された
    Confirmed,
}

// ============================================================================
// Management Agent
// ============================================================================

#[derive(Default)]
struct Mailbox {
    /// 応答待ちの管理ORBアドレス
    expected: Option<u64>,
    status: Option<StatusBlock>,
}

/// 管理ORBの送信先と実行環境
pub struct ManagementTarget<'a> {
    pub bus: &'a dyn BusTransport,
    pub dma: &'a dyn DmaPlatform,
    pub timer: &'a dyn Timer,
    /// ホスト（自ノード）
    pub host: NodeId,
    pub node: NodeId,
    pub generation: Generation,
    /// 管理エージェントのCSRアドレス
    pub agent: u64,
    pub status_fifo: u64,
    pub retries: u32,
}

/// セッション毎の管理ORBとログイン応答の領域
pub struct ManagementAgent {
    orb: DmaRegion,
    response: DmaRegion,
    mailbox: Mutex<Mailbox>,
}

impl ManagementAgent {
    pub fn new(dma: &dyn DmaPlatform) -> Result<Self, DmaError> {
        let orb = dma.alloc_coherent(defs::MANAGEMENT_ORB_SIZE)?;
        let response = match dma.alloc_coherent(defs::LOGIN_RESPONSE_SIZE) {
            Ok(r) => r,
            Err(e) => {
                dma.free_coherent(orb);
                return Err(e);
            }
        };
        Ok(Self { orb, response, mailbox: Mutex::new(Mailbox::default()) })
    }

    pub fn destroy(self, dma: &dyn DmaPlatform) {
        dma.free_coherent(self.orb);
        dma.free_coherent(self.response);
    }

    /// 管理ORBのバスアドレス
    pub fn orb_address(&self) -> u64 {
        self.orb.bus_addr
    }

    /// ログイン応答のバスアドレス
    pub fn response_address(&self) -> u64 {
        self.response.bus_addr
    }

    /// 完了ルータから: 待機中の管理ORBに対するステータスなら受け取る
    pub fn deliver(&self, status: &StatusBlock) -> bool {
        let mut mailbox = self.mailbox.lock();
        match mailbox.expected {
            Some(addr) if addr == status.orb_offset() => {
                mailbox.status = Some(*status);
                true
            }
            _ => false,
        }
    }

    /// このエージェントのORBに一致するか（待機中でなくても）
    pub fn owns(&self, status: &StatusBlock) -> bool {
        status.orb_offset() == self.orb.bus_addr
    }

    fn take_status(&self) -> Option<StatusBlock> {
        self.mailbox.lock().status.take()
    }

    /// 管理ORBを書いてエージェントに渡し、ステータスを有界待ちする
    async fn execute(
        &self,
        target: &ManagementTarget<'_>,
        orb: &[u8; defs::MANAGEMENT_ORB_SIZE],
        timeout_ms: u64,
    ) -> Result<StatusBlock, SessionError> {
        target.dma.write_coherent(&self.orb, 0, orb);
        {
            let mut mailbox = self.mailbox.lock();
            mailbox.expected = Some(self.orb.bus_addr);
            mailbox.status = None;
        }
        fence(Ordering::SeqCst);

        let pointer = OrbPointer::Address { node: target.host, address: self.orb.bus_addr }.to_wire();
        let written = write_with_retries(
            target.bus,
            target.node,
            target.generation,
            target.agent,
            &pointer,
            target.retries,
        )
        .await;
        if let Err(e) = written {
            self.mailbox.lock().expected = None;
            log::warn!("[SBP2] management agent write to {:?} failed: {}", target.node, e);
            return Err(SessionError::Timeout);
        }

        let outcome = wait_until(target.timer, timeout_ms, defs::MANAGEMENT_POLL_INTERVAL_MS, || {
            self.take_status()
        })
        .await;
        self.mailbox.lock().expected = None;

        let status = match outcome {
            WaitOutcome::Ready(status) => status,
            WaitOutcome::TimedOut => return Err(SessionError::Timeout),
        };
        if status.response() != Response::RequestComplete || status.sbp_status() != 0 || status.is_dead() {
            log::debug!(
                "[SBP2] management ORB rejected: resp={:?} sbp_status={:#x}",
                status.response(),
                status.sbp_status()
            );
            return Err(SessionError::Rejected);
        }
        Ok(status)
    }

    /// ログイン
    pub async fn login(
        &self,
        target: &ManagementTarget<'_>,
        lun: u16,
        exclusive: bool,
        timeout_ms: u64,
    ) -> Result<LoginResponse, SessionError> {
        target.dma.write_coherent(&self.response, 0, &[0u8; defs::LOGIN_RESPONSE_SIZE]);
        let orb = LoginOrb {
            host_node: target.host,
            login_response: self.response.bus_addr,
            login_response_len: defs::LOGIN_RESPONSE_SIZE as u16,
            lun,
            exclusive,
            reconnect_hold: 0,
            status_fifo: target.status_fifo,
        };
        self.execute(target, &orb.to_wire(), timeout_ms).await?;

        let mut raw = [0u8; defs::LOGIN_RESPONSE_SIZE];
        target.dma.read_coherent(&self.response, 0, &mut raw);
        match LoginResponse::from_wire(&raw) {
            Some(resp) if resp.command_agent != 0 => Ok(resp),
            _ => Err(SessionError::Mismatch),
        }
    }

    /// 再接続
    pub async fn reconnect(&self, target: &ManagementTarget<'_>, login_id: u16, timeout_ms: u64) -> Result<(), SessionError> {
        let orb = LoginIdOrb::reconnect(target.host, login_id, target.status_fifo);
        self.execute(target, &orb.to_wire(), timeout_ms).await.map(|_| ())
    }

    /// ログアウト（ベストエフォート）
    pub async fn logout(&self, target: &ManagementTarget<'_>, login_id: u16, timeout_ms: u64) -> Result<(), SessionError> {
        let orb = LoginIdOrb::logout(target.host, login_id, target.status_fifo);
        self.execute(target, &orb.to_wire(), timeout_ms).await.map(|_| ())
    }
}

// ============================================================================
// Negotiation
// ============================================================================

/// 速度と max_payload（ORBエンコーディング）を決める
///
/// max_rec は 2^(max_rec+1) バイト。
pub fn negotiate(
    node_speed: BusSpeed,
    max_speed: BusSpeed,
    device_max_rec: u8,
    adapter_max_rec: u8,
    payload_ceiling: u32,
) -> (BusSpeed, u8) {
    let speed = node_speed.min(max_speed);
    let payload = speed
        .max_payload_code()
        .min(device_max_rec.saturating_sub(1))
        .min(adapter_max_rec.saturating_sub(1))
        .min(max_payload_code(payload_ceiling));
    (speed, payload)
}

// ============================================================================
// Device Session
// ============================================================================

/// 接続中の論理ユニット1つ分のセッション
pub struct DeviceSession {
    pub handle: SessionHandle,
    state: SessionState,
    pub validation: Validation,
    pub node: NodeId,
    pub generation: Generation,
    /// EUI-64
    pub guid: u64,
    pub lun: LogicalUnit,
    pub unit: UnitInfo,
    pub quirks: Quirks,
    /// デバイスのmax_rec（バス情報ブロック）
    pub device_max_rec: u8,
    pub speed: BusSpeed,
    pub max_payload: u8,
    pub command_agent: u64,
    pub login_id: Option<u16>,
    pub status_fifo: u64,
    pub management: Arc<ManagementAgent>,
    pub orbs: OrbPool,
    /// パケット不足で実行できなかったフェッチエージェントリセット
    pub agent_reset_deferred: bool,
}

impl DeviceSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 状態遷移
    pub fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(to) {
            log::warn!("[SBP2] session {}: invalid transition {:?} -> {:?}", self.handle.slot, self.state, to);
            return Err(SessionError::InvalidStateTransition);
        }
        log::debug!("[SBP2] session {}: {:?} -> {:?}", self.handle.slot, self.state, to);
        self.state = to;
        Ok(())
    }

    /// 管理ORBの送信先
    pub fn management_target<'a>(
        &self,
        bus: &'a dyn BusTransport,
        dma: &'a dyn DmaPlatform,
        timer: &'a dyn Timer,
        retries: u32,
    ) -> ManagementTarget<'a> {
        ManagementTarget {
            bus,
            dma,
            timer,
            host: bus.local_node(),
            node: self.node,
            generation: self.generation,
            agent: self.unit.management_agent,
            status_fifo: self.status_fifo,
            retries,
        }
    }

    /// ログインのタイムアウト（ユニット特性の方が長ければそちら）
    pub fn login_timeout_ms(&self, configured: u64) -> u64 {
        configured.max(self.unit.characteristics.mgmt_timeout_ms())
    }

    /// 同一デバイスか（EUI-64 + LUN）
    pub fn is_same_unit(&self, guid: u64, lun: u16) -> bool {
        self.guid == guid && self.lun.lun == lun
    }

    /// コマンドエージェントのレジスタアドレス
    pub fn agent_register(&self, offset: u64) -> u64 {
        self.command_agent + offset
    }

    /// RBCデバイスか
    pub fn is_rbc(&self) -> bool {
        self.lun.device_type == defs::DEVICE_TYPE_RBC
    }

    /// DMA領域を返す
    ///
    /// 使用中の記述子は事前に回収しておくこと。
    pub fn teardown(self, dma: &dyn DmaPlatform) {
        self.orbs.destroy(dma);
        match Arc::try_unwrap(self.management) {
            Ok(management) => management.destroy(dma),
            // 管理ORBの待機中。デバイスが書き込み得るので領域は解放しない
            Err(_) => log::warn!("[SBP2] session {}: management area still in use", self.handle.slot),
        }
    }
}

/// 新規セッションの属性
pub struct NewSession {
    pub node: NodeId,
    pub generation: Generation,
    pub guid: u64,
    pub lun: LogicalUnit,
    pub unit: UnitInfo,
    pub quirks: Quirks,
    pub device_max_rec: u8,
    pub status_fifo: u64,
    pub management: ManagementAgent,
    pub orbs: OrbPool,
}

// ============================================================================
// Session Table
// ============================================================================

/// 固定長のセッション表（スロット + 世代）
pub struct SessionTable {
    slots: alloc::vec::Vec<Option<DeviceSession>>,
    generations: alloc::vec::Vec<u32>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, generations: alloc::vec![0; capacity] }
    }

    /// 空きスロット
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// セッションを `slot` に作る（状態は `Unknown`、確認マークは `Stale`）
    pub fn insert(&mut self, slot: usize, new: NewSession) -> Result<SessionHandle, SessionError> {
        if self.slots.get(slot).is_none_or(|s| s.is_some()) {
            return Err(SessionError::TableFull);
        }
        let handle = SessionHandle { slot: slot as u16, generation: self.generations[slot] };
        self.slots[slot] = Some(DeviceSession {
            handle,
            state: SessionState::Unknown,
            // Active に入った時点で Confirmed になる
            validation: Validation::Stale,
            node: new.node,
            generation: new.generation,
            guid: new.guid,
            lun: new.lun,
            unit: new.unit,
            quirks: new.quirks,
            device_max_rec: new.device_max_rec,
            speed: BusSpeed::S100,
            max_payload: 0,
            command_agent: 0,
            login_id: None,
            status_fifo: new.status_fifo,
            management: Arc::new(new.management),
            orbs: new.orbs,
            agent_reset_deferred: false,
        });
        Ok(handle)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&DeviceSession> {
        let slot = handle.slot as usize;
        if self.generations.get(slot) != Some(&handle.generation) {
            return None;
        }
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut DeviceSession> {
        let slot = handle.slot as usize;
        if self.generations.get(slot) != Some(&handle.generation) {
            return None;
        }
        self.slots[slot].as_mut()
    }

    /// スロット番号で引く（ステータス受信時）
    pub fn by_slot_mut(&mut self, slot: usize) -> Option<&mut DeviceSession> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// セッションを外す。以後このハンドルは無効
    pub fn remove(&mut self, handle: SessionHandle) -> Option<DeviceSession> {
        let slot = handle.slot as usize;
        if self.generations.get(slot) != Some(&handle.generation) {
            return None;
        }
        let session = self.slots[slot].take()?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        Some(session)
    }

    pub fn find_unit(&self, guid: u64, lun: u16) -> Option<SessionHandle> {
        self.iter().find(|s| s.is_same_unit(guid, lun)).map(|s| s.handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSession> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceSession> {
        self.slots.iter_mut().flatten()
    }

    pub fn handles(&self) -> alloc::vec::Vec<SessionHandle> {
        self.iter().map(|s| s.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
