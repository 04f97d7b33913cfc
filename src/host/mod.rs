// ============================================================================
// src/host/mod.rs - Host Adapter
// ============================================================================
//!
//! # ホストアダプタ
//!
//! バス層が報告したアダプタ1つにつき1つ。セッション表・保留キュー・
//! 要求パケットプールを持ち、汎用コマンド層に `submit` / `abort` / `reset` を提供する。
//!
//! ## ロック規律
//! アダプタロック (`inner`) はセッション表・記述子リスト・last_issued・
//! 保留キューを守る短時間ロック。バストランザクションと完了コールバックは
//! 必ずロックの外で行う。
//!
//! ## 発行パス
//! ```text
//! submit -> translate (DMAマップ) -> packet acquire
//!        -> [lock] 記述子確保・ORB記入・リンク [unlock]
//!        -> post_write(ORB_POINTER または DOORBELL)
//! ```

pub mod registry;
pub mod worker;


use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
#[cfg(feature = "stats")]
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

pub use registry::{HostAdapterRegistry, adapter_registry};

use crate::bus::{BusResetListener, BusTransport, Generation, NodeId, StatusRange, StatusSink};
use crate::config::DriverConfig;
use crate::dma::{DmaPlatform, MappedBuffer};
use crate::error::{DmaError, GeneralError, PoolError, Sbp2Error};
use crate::sbp2::completion::{RouteOutcome, route_status};
use crate::sbp2::defs::{self, agent};
use crate::sbp2::orb::{OrbPointer, PageTableEntry};
use crate::sbp2::orb_pool::{AgentWrite, FinishedRequest, InFlightRequest};
use crate::sbp2::packet_pool::{RequestPacket, RequestPacketPool};
use crate::sbp2::quirks::Quirks;
use crate::sbp2::session::{SessionHandle, SessionState, SessionTable};
use crate::sbp2::translate::{DataShape, OrbParams, TranslateParams, Translation, build_orb, translate};
use crate::scsi::{CommandId, CommandResult, CompletionCallback, ScsiCommand};
use crate::time::{Timer, WaitOutcome, wait_until};
use worker::ResetSignal;

// ============================================================================
// Public Types
// ============================================================================

/// `abort` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// 保留キューから外して "aborted" で完了させた
    Aborted,
    /// 既にデバイスに発行済み（中止できない）
    InFlight,
    /// 見つからない
    NotFound,
}

/// バックプレッシャーで差し戻されたコマンド
pub struct SubmitRejected {
    pub command: ScsiCommand,
    pub callback: CompletionCallback,
    pub reason: Sbp2Error,
}

impl fmt::Debug for SubmitRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitRejected")
            .field("command", &self.command.id)
            .field("reason", &self.reason)
            .finish()
    }
}

/// 汎用層に公開する論理ユニット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedDevice {
    pub handle: SessionHandle,
    pub node: NodeId,
    /// EUI-64
    pub guid: u64,
    pub lun: u16,
    pub device_type: u8,
    pub model_id: u32,
    pub firmware_revision: u32,
    pub quirks: Quirks,
}

/// アダプタ統計
#[cfg(feature = "stats")]
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub orb_pointer_writes: AtomicU64,
    pub doorbells: AtomicU64,
    pub dropped_statuses: AtomicU64,
    pub agent_resets: AtomicU64,
}

#[cfg(feature = "stats")]
impl AdapterStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Adapter State
// ============================================================================

/// バスリセット中に受け付けたコマンド
struct PendingCommand {
    command: ScsiCommand,
    callback: CompletionCallback,
}

/// アダプタロックで守る状態
struct AdapterInner {
    sessions: SessionTable,
    pending: VecDeque<PendingCommand>,
    bus_reset_in_progress: bool,
    removed: bool,
}

/// ホストアダプタ
pub struct HostAdapter {
    id: u32,
    bus: Arc<dyn BusTransport>,
    dma: Arc<dyn DmaPlatform>,
    timer: Arc<dyn Timer>,
    config: DriverConfig,
    packets: Arc<RequestPacketPool>,
    inner: Mutex<AdapterInner>,
    signal: ResetSignal,
    self_ref: Weak<HostAdapter>,
    #[cfg(feature = "stats")]
    stats: AdapterStats,
}

/// ステータスFIFO 1スロット分のシンク
struct StatusPort {
    adapter: Weak<HostAdapter>,
    slot: usize,
}

impl StatusSink for StatusPort {
    fn status_write(&self, source: NodeId, data: &[u8]) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.route_status(self.slot, source, data);
        }
    }
}

/// バスリセット通知をアダプタに渡す
struct ResetHook(Weak<HostAdapter>);

impl BusResetListener for ResetHook {
    fn bus_reset(&self, generation: Generation) {
        if let Some(adapter) = self.0.upgrade() {
            adapter.bus_reset(generation);
        }
    }
}

impl HostAdapter {
    /// アダプタを作り、バスリセット通知を購読する
    ///
    /// 最初の走査はワーカーが行う（リセット信号を立てておく）。
    pub fn new(
        id: u32,
        bus: Arc<dyn BusTransport>,
        dma: Arc<dyn DmaPlatform>,
        timer: Arc<dyn Timer>,
        config: DriverConfig,
    ) -> Result<Arc<Self>, Sbp2Error> {
        config.validate()?;
        let adapter = Arc::new_cyclic(|weak| Self {
            id,
            packets: Arc::new(RequestPacketPool::new(config.request_packets)),
            inner: Mutex::new(AdapterInner {
                sessions: SessionTable::new(defs::MAX_SESSIONS),
                pending: VecDeque::new(),
                bus_reset_in_progress: true,
                removed: false,
            }),
            signal: ResetSignal::new(),
            self_ref: weak.clone(),
            bus,
            dma,
            timer,
            config,
            #[cfg(feature = "stats")]
            stats: AdapterStats::default(),
        });
        adapter.bus.on_bus_reset(Arc::new(ResetHook(Arc::downgrade(&adapter))));
        adapter.signal.notify();
        log::info!("[SBP2] adapter {} attached (local node {:?})", id, adapter.bus.local_node());
        Ok(adapter)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    /// ステータスFIFOの範囲
    fn status_range(&self, slot: usize) -> StatusRange {
        StatusRange { base: self.config.status_fifo_for(slot), len: defs::STATUS_FIFO_STRIDE as u32 }
    }

    /// 公開中の論理ユニット
    pub fn devices(&self) -> Vec<ExportedDevice> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|s| s.state() == SessionState::Active)
            .map(|s| ExportedDevice {
                handle: s.handle,
                node: s.node,
                guid: s.guid,
                lun: s.lun.lun,
                device_type: s.lun.device_type,
                model_id: s.unit.model_id,
                firmware_revision: s.unit.firmware_revision,
                quirks: s.quirks,
            })
            .collect()
    }

    /// セッションの状態（テスト・診断用）
    pub fn session_state(&self, handle: SessionHandle) -> Option<SessionState> {
        self.inner.lock().sessions.get(handle).map(|s| s.state())
    }

    /// 保留キューの長さ
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// 全セッションの使用中記述子数
    pub fn outstanding(&self) -> usize {
        self.inner.lock().sessions.iter().map(|s| s.orbs.in_use_count()).sum()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    // ========================================================================
    // Generic Command Layer Interface
    // ========================================================================

    /// コマンドを受け付ける
    ///
    /// 資源不足のときはコマンドとコールバックを `SubmitRejected` で返す。
    /// それ以外の結果はすべてコールバックで届く（ちょうど一度）。
    pub fn submit(&self, command: ScsiCommand, callback: CompletionCallback) -> Result<(), SubmitRejected> {
        let params = {
            let mut inner = self.inner.lock();
            if inner.removed {
                drop(inner);
                callback(command.id, CommandResult::NoConnection);
                return Ok(());
            }
            let reset = inner.bus_reset_in_progress;
            let state = inner.sessions.get(command.target).map(|s| (s.state(), s.quirks, s.is_rbc(), s.orbs.capacity()));
            match state {
                None | Some((SessionState::Failed | SessionState::Closed | SessionState::LoggingOut, ..)) => {
                    drop(inner);
                    callback(command.id, CommandResult::NoConnection);
                    return Ok(());
                }
                Some((state, ..)) if reset || !state.accepts_commands() => {
                    inner.pending.push_back(PendingCommand { command, callback });
                    return Ok(());
                }
                Some((_, quirks, rbc, max_fragments)) => TranslateParams {
                    quirks,
                    rbc,
                    limited_max_blocks: self.config.limited_max_blocks,
                    max_fragments,
                },
            }
        };
        self.issue(command, callback, &params)
    }

    /// 発行パス（アダプタロックの外から呼ぶ）
    fn issue(
        &self,
        command: ScsiCommand,
        callback: CompletionCallback,
        params: &TranslateParams,
    ) -> Result<(), SubmitRejected> {
        let id = command.id;
        let translation = match translate(&command, params, self.dma.as_ref()) {
            Ok(t) => t,
            Err(reason @ Sbp2Error::Dma(DmaError::AllocationFailed | DmaError::MappingFailed)) => {
                return Err(SubmitRejected { command, callback, reason });
            }
            Err(e) => {
                log::warn!("[SBP2] command {:?} cannot be translated: {}", id, e);
                callback(id, CommandResult::TransportError);
                return Ok(());
            }
        };
        let (fragments, mapping, from_device, fixup) = match translation {
            Translation::Synthesized => {
                callback(id, CommandResult::Good);
                return Ok(());
            }
            Translation::Orbs { fragments, mapping, from_device, fixup } => (fragments, mapping, from_device, fixup),
        };

        let unmap = |mapping: Option<MappedBuffer>| {
            if let Some(m) = mapping {
                self.dma.unmap(m);
            }
        };

        let packet = match self.packets.acquire() {
            Ok(p) => p,
            Err(e) => {
                unmap(mapping);
                return Err(SubmitRejected { command, callback, reason: e.into() });
            }
        };

        let host = self.bus.local_node();
        let mut inner = self.inner.lock();
        let reset = inner.bus_reset_in_progress;
        let Some(session) = inner.sessions.get_mut(command.target) else {
            drop(inner);
            self.packets.release(packet);
            unmap(mapping);
            callback(id, CommandResult::NoConnection);
            return Ok(());
        };
        if reset || !session.state().accepts_commands() {
            // 変換の途中でバスリセットが入った
            inner.pending.push_back(PendingCommand { command, callback });
            drop(inner);
            self.packets.release(packet);
            unmap(mapping);
            return Ok(());
        }
        if session.orbs.free_count() < fragments.len() {
            drop(inner);
            self.packets.release(packet);
            unmap(mapping);
            return Err(SubmitRejected { command, callback, reason: PoolError::OutOfDescriptors.into() });
        }

        // 前回パケット不足で保留したエージェントリセット
        let reset_packet = if session.agent_reset_deferred {
            match self.packets.acquire_with(&[0; 4]) {
                Ok(p) => {
                    session.agent_reset_deferred = false;
                    Some(p)
                }
                Err(e) => {
                    drop(inner);
                    self.packets.release(packet);
                    unmap(mapping);
                    return Err(SubmitRejected { command, callback, reason: e.into() });
                }
            }
        } else {
            None
        };

        let orb_params = OrbParams { host, speed: session.speed, max_payload: session.max_payload };
        let request = InFlightRequest::new(id, callback, mapping).with_fixup(fixup);
        let chain = match session.orbs.allocate(fragments.len(), request) {
            Ok(chain) => chain,
            Err(request) => {
                drop(inner);
                self.packets.release(packet);
                if let Some(p) = reset_packet {
                    self.packets.release(p);
                }
                let (callback, mapping) = request.into_parts();
                unmap(mapping);
                if let Some(callback) = callback {
                    callback(id, CommandResult::TransportError);
                }
                return Ok(());
            }
        };
        for (fragment, &index) in fragments.iter().zip(chain.iter()) {
            let page_table = session.orbs.descriptor(index).page_table_address();
            let orb = build_orb(fragment, from_device, &orb_params, page_table);
            let table: &[PageTableEntry] = match &fragment.data {
                DataShape::PageTable(t) => t,
                _ => &[],
            };
            session.orbs.write_orb(self.dma.as_ref(), index, &orb, table);
        }
        let action = session.orbs.announce(self.dma.as_ref(), host, &chain);
        let (node, generation, command_agent) = (session.node, session.generation, session.command_agent);
        drop(inner);

        #[cfg(feature = "verbose_logging")]
        log::trace!("[SBP2] issue {:?}: {} fragment(s), {:?}", id, chain.len(), action);

        if let Some(p) = reset_packet {
            #[cfg(feature = "stats")]
            AdapterStats::bump(&self.stats.agent_resets);
            self.post(node, generation, command_agent + agent::AGENT_RESET, p);
        }
        self.post_agent_write(node, generation, command_agent, host, action, packet);
        Ok(())
    }

    /// コマンドエージェントへの書き込みを投げる
    fn post_agent_write(
        &self,
        node: NodeId,
        generation: Generation,
        command_agent: u64,
        host: NodeId,
        action: Option<AgentWrite>,
        mut packet: RequestPacket,
    ) {
        match action {
            Some(AgentWrite::OrbPointer(address)) => {
                #[cfg(feature = "stats")]
                AdapterStats::bump(&self.stats.orb_pointer_writes);
                packet.fill(&OrbPointer::Address { node: host, address }.to_wire());
                self.post(node, generation, command_agent + agent::ORB_POINTER, packet);
            }
            Some(AgentWrite::Doorbell) => {
                #[cfg(feature = "stats")]
                AdapterStats::bump(&self.stats.doorbells);
                packet.fill(&[0; 4]);
                self.post(node, generation, command_agent + agent::DOORBELL, packet);
            }
            None => self.packets.release(packet),
        }
    }

    fn post(&self, node: NodeId, generation: Generation, address: u64, packet: RequestPacket) {
        self.bus.post_write(node, generation, address, packet, self.packets.clone());
    }

    /// 保留中のコマンドを中止する
    ///
    /// 発行済みのコマンドは中止できない。
    pub fn abort(&self, id: CommandId) -> AbortOutcome {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.pending.iter().position(|p| p.command.id == id) {
            let pending = inner.pending.remove(pos);
            drop(inner);
            if let Some(p) = pending {
                (p.callback)(id, CommandResult::Aborted);
            }
            return AbortOutcome::Aborted;
        }
        if inner.sessions.iter().any(|s| s.orbs.is_in_flight(id)) {
            AbortOutcome::InFlight
        } else {
            AbortOutcome::NotFound
        }
    }

    /// バスリセットを発行し、記述子が排出されるのを有界に待つ
    pub async fn reset(&self) -> Result<(), Sbp2Error> {
        self.bus.reset_bus()?;
        let outcome = wait_until(
            self.timer.as_ref(),
            self.config.reset_wait_ms,
            defs::MANAGEMENT_POLL_INTERVAL_MS,
            || if self.outstanding() == 0 { Some(()) } else { None },
        )
        .await;
        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => {
                log::warn!("[SBP2] adapter {}: {} descriptor(s) outstanding after reset", self.id, self.outstanding());
                Err(GeneralError::OutstandingAfterReset.into())
            }
        }
    }

    // ========================================================================
    // Bus Layer Callbacks
    // ========================================================================

    /// バスリセット通知（バス層のコンテキスト）
    fn bus_reset(&self, generation: Generation) {
        log::info!("[SBP2] adapter {}: bus reset, generation {}", self.id, generation.0);
        self.inner.lock().bus_reset_in_progress = true;
        self.signal.notify();
    }

    /// ステータス書き込み（バス層の配送コンテキスト、スリープ禁止）
    fn route_status(&self, slot: usize, source: NodeId, data: &[u8]) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.by_slot_mut(slot) else {
            drop(inner);
            self.note_dropped_status();
            log::debug!("[SBP2] status for empty slot {} dropped", slot);
            return;
        };
        if session.node != source {
            drop(inner);
            self.note_dropped_status();
            log::debug!("[SBP2] status from unexpected node {:?} on slot {} dropped", source, slot);
            return;
        }

        let (finished, agent_reset) = match route_status(session, data) {
            RouteOutcome::Management => return,
            RouteOutcome::Dropped => {
                drop(inner);
                self.note_dropped_status();
                return;
            }
            RouteOutcome::Completed { finished, agent_reset } => (finished, agent_reset),
        };

        let reset_write = match agent_reset {
            Some(address) => match self.packets.acquire_with(&[0; 4]) {
                Ok(packet) => Some((address, packet)),
                Err(_) => {
                    log::debug!("[SBP2] session {}: agent reset deferred (no packet)", slot);
                    session.agent_reset_deferred = true;
                    None
                }
            },
            None => None,
        };
        let (node, generation) = (session.node, session.generation);
        drop(inner);

        if let Some((address, packet)) = reset_write {
            #[cfg(feature = "stats")]
            AdapterStats::bump(&self.stats.agent_resets);
            self.post(node, generation, address, packet);
        }
        self.complete_all(finished);
    }

    fn note_dropped_status(&self) {
        #[cfg(feature = "stats")]
        AdapterStats::bump(&self.stats.dropped_statuses);
    }

    /// 完了したリクエストを処理する（ロックの外）
    fn complete_all(&self, finished: Vec<FinishedRequest>) {
        for f in finished {
            f.complete(self.dma.as_ref());
        }
    }

    /// 保留キューのコマンドを再投入する
    fn drain_pending(&self, pending: VecDeque<PendingCommand>) {
        for PendingCommand { command, callback } in pending {
            if let Err(rejected) = self.submit(command, callback) {
                // 呼び出し元がいないので再送を促す
                (rejected.callback)(rejected.command.id, CommandResult::BusyRetry);
            }
        }
    }
}
