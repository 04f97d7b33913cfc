// ============================================================================
// src/host/worker.rs - Bus Reset Worker
// ============================================================================
//!
//! # バスリセットワーカー
//!
//! アダプタ毎に1つの長寿命タスク。リセット信号が立つまで休眠し、
//! 起きたらトポロジを走査してセッションを再確立する。
//!
//! ## 走査手順
//! 1. 全セッションの確認マークをクリア
//! 2. 電気的な回復を待つ
//! 3. ノードを走査（`sbp2::discovery`）
//! 4. 既知のデバイスは再接続、新しいデバイスはログイン
//! 5. 確認されなかったセッションを破棄（"no connection"）
//! 6. 保留キューを再投入

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll, Waker};

use spin::Mutex;

use super::{HostAdapter, StatusPort};
use crate::bus::{Generation, write_with_retries};
use crate::sbp2::defs::{self, agent};
use crate::sbp2::discovery::{DiscoveredUnit, scan_bus};
use crate::sbp2::orb_pool::OrbPool;
use crate::sbp2::quirks::Quirks;
use crate::sbp2::orb::max_payload_bytes;
use crate::sbp2::session::{ManagementAgent, NewSession, SessionHandle, SessionState, Validation, negotiate};
use crate::scsi::CommandResult;

// ============================================================================
// Reset Signal
// ============================================================================

/// ワーカーを起こす信号（複数回の通知は1回にまとまる）
pub struct ResetSignal {
    pending: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl ResetSignal {
    pub fn new() -> Self {
        Self { pending: AtomicBool::new(false), waker: Mutex::new(None) }
    }

    /// 信号を立ててワーカーを起こす
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }

    /// 信号を消費する
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// 信号が立つまで待つ
    pub fn wait(&self) -> ResetWait<'_> {
        ResetWait { signal: self }
    }
}

impl Default for ResetSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// `ResetSignal::wait` のFuture
pub struct ResetWait<'a> {
    signal: &'a ResetSignal,
}

impl Future for ResetWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.take() {
            return Poll::Ready(());
        }
        *self.signal.waker.lock() = Some(cx.waker().clone());
        // 登録と通知の競合を拾う
        if self.signal.take() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

// ============================================================================
// Worker
// ============================================================================

impl HostAdapter {
    /// ワーカータスク本体
    ///
    /// アダプタが外されるまで戻らない。カーネルのエグゼキュータに spawn する。
    pub async fn run_worker(self: Arc<Self>) {
        log::debug!("[SBP2] adapter {}: worker started", self.id);
        loop {
            self.signal.wait().await;
            if self.is_removed() {
                break;
            }
            self.scan().await;
        }
        log::debug!("[SBP2] adapter {}: worker stopped", self.id);
    }

    /// 保留中のリセット信号があれば走査する（1回分）
    pub async fn service_reset(&self) -> bool {
        if !self.signal.take() || self.is_removed() {
            return false;
        }
        self.scan().await;
        true
    }

    /// トポロジを走査してセッションを再確立する
    pub async fn scan(&self) {
        loop {
            let generation = self.bus.current_generation();
            {
                let mut inner = self.inner.lock();
                inner.bus_reset_in_progress = true;
                for session in inner.sessions.iter_mut() {
                    session.validation = Validation::Stale;
                }
            }

            self.timer.sleep_ms(self.config.settle_delay_ms).await;
            if self.bus.current_generation() != generation {
                continue;
            }

            let units = scan_bus(self.bus.as_ref(), generation, self.config.transport_retries).await;
            for unit in units {
                self.attach_unit(unit, generation).await;
            }

            if self.bus.current_generation() != generation {
                // 走査中に次のリセットが来た
                continue;
            }
            self.destroy_stale();

            let pending = {
                let mut inner = self.inner.lock();
                inner.bus_reset_in_progress = false;
                core::mem::take(&mut inner.pending)
            };
            log::info!(
                "[SBP2] adapter {}: scan complete, {} device(s), {} deferred command(s)",
                self.id,
                self.devices().len(),
                pending.len()
            );
            self.drain_pending(pending);
            break;
        }
    }

    /// 見つかった論理ユニットを既存セッションに結びつけるか、新しく作る
    async fn attach_unit(&self, unit: DiscoveredUnit, generation: Generation) {
        let existing = {
            let mut inner = self.inner.lock();
            match inner.sessions.find_unit(unit.guid(), unit.lun.lun) {
                Some(handle) => {
                    let Some(session) = inner.sessions.get_mut(handle) else { return };
                    session.node = unit.node;
                    session.generation = generation;
                    session.device_max_rec = unit.bus_info.max_rec;
                    let reconnectable = session.state() == SessionState::Active && session.login_id.is_some();
                    Some((handle, reconnectable))
                }
                None => None,
            }
        };

        match existing {
            Some((handle, true)) => self.reconnect(handle).await,
            Some((handle, false)) => {
                // 失敗済みなどで再利用できない。作り直す
                self.destroy_session(handle, CommandResult::NoConnection);
                if let Some(handle) = self.create_session(&unit, generation) {
                    self.login(handle).await;
                }
            }
            None => {
                if let Some(handle) = self.create_session(&unit, generation) {
                    self.login(handle).await;
                }
            }
        }
    }

    /// セッションを作ってステータスFIFOを登録する
    fn create_session(&self, unit: &DiscoveredUnit, generation: Generation) -> Option<SessionHandle> {
        let dma = self.dma.as_ref();
        let management = match ManagementAgent::new(dma) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("[SBP2] {:?}: cannot allocate management area: {}", unit.node, e);
                return None;
            }
        };
        let orbs = match OrbPool::new(dma, self.config.orbs_per_session) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[SBP2] {:?}: cannot allocate command descriptors: {}", unit.node, e);
                management.destroy(dma);
                return None;
            }
        };
        let quirks = Quirks::resolve(
            unit.unit.firmware_revision,
            unit.unit.model_id,
            self.config.workaround_overrides,
        );
        if !quirks.is_empty() {
            log::info!("[SBP2] {:?}: workarounds {:?}", unit.node, quirks);
        }

        let (handle, range) = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.sessions.free_slot() else {
                drop(inner);
                log::warn!("[SBP2] adapter {}: session table full", self.id);
                management.destroy(dma);
                orbs.destroy(dma);
                return None;
            };
            let new = NewSession {
                node: unit.node,
                generation,
                guid: unit.guid(),
                lun: unit.lun,
                unit: unit.unit.clone(),
                quirks,
                device_max_rec: unit.bus_info.max_rec,
                status_fifo: self.config.status_fifo_for(slot),
                management,
                orbs,
            };
            match inner.sessions.insert(slot, new) {
                Ok(handle) => (handle, self.status_range(slot)),
                Err(_) => return None,
            }
        };

        let port = Arc::new(StatusPort { adapter: self.self_ref.clone(), slot: handle.slot as usize });
        if let Err(e) = self.bus.register_status_sink(range, port) {
            log::warn!("[SBP2] cannot register status FIFO {:#x}: {}", range.base, e);
            let removed = self.inner.lock().sessions.remove(handle);
            if let Some(session) = removed {
                session.teardown(self.dma.as_ref());
            }
            return None;
        }
        Some(handle)
    }

    /// 既存のログインを再接続する。失敗したら同じスロットで新規ログイン
    async fn reconnect(&self, handle: SessionHandle) {
        let (management, target, login_id) = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(handle) else { return };
            let Some(login_id) = session.login_id else { return };
            if session.transition(SessionState::Reconnecting).is_err() {
                return;
            }
            let target = session.management_target(
                self.bus.as_ref(),
                self.dma.as_ref(),
                self.timer.as_ref(),
                self.config.transport_retries,
            );
            (session.management.clone(), target, login_id)
        };

        let result = management.reconnect(&target, login_id, self.config.reconnect_timeout_ms).await;
        drop(management);
        match result {
            Ok(()) => {
                log::info!("[SBP2] session {}: reconnected (login id {})", handle.slot, login_id);
                self.enter_active(handle).await;
            }
            Err(e) => {
                log::warn!("[SBP2] session {}: reconnect failed ({}), logging in again", handle.slot, e);
                {
                    let mut inner = self.inner.lock();
                    let Some(session) = inner.sessions.get_mut(handle) else { return };
                    session.login_id = None;
                    if session.transition(SessionState::LoggingIn).is_err() {
                        return;
                    }
                }
                self.login(handle).await;
            }
        }
    }

    /// ログインする
    async fn login(&self, handle: SessionHandle) {
        let (management, target, lun, timeout) = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(handle) else { return };
            if session.state() != SessionState::LoggingIn && session.transition(SessionState::LoggingIn).is_err() {
                return;
            }
            let target = session.management_target(
                self.bus.as_ref(),
                self.dma.as_ref(),
                self.timer.as_ref(),
                self.config.transport_retries,
            );
            (
                session.management.clone(),
                target,
                session.lun.lun,
                session.login_timeout_ms(self.config.login_timeout_ms),
            )
        };

        let result = management.login(&target, lun, self.config.exclusive_login, timeout).await;
        drop(management);

        match result {
            Ok(response) => {
                {
                    let mut inner = self.inner.lock();
                    let Some(session) = inner.sessions.get_mut(handle) else { return };
                    session.login_id = Some(response.login_id);
                    session.command_agent = response.command_agent;
                }
                log::info!(
                    "[SBP2] session {}: logged in (login id {}, agent {:#x})",
                    handle.slot,
                    response.login_id,
                    response.command_agent
                );
                self.enter_active(handle).await;
            }
            Err(e) => {
                log::warn!("[SBP2] session {}: login failed: {}", handle.slot, e);
                let mut inner = self.inner.lock();
                if let Some(session) = inner.sessions.get_mut(handle) {
                    let _ = session.transition(SessionState::Failed);
                }
            }
        }
    }

    /// Active に入る: BUSY_TIMEOUT 設定、フェッチエージェントリセット、速度/ペイロード交渉
    async fn enter_active(&self, handle: SessionHandle) {
        let (node, generation, command_agent) = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(handle) else { return };
            let (speed, max_payload) = negotiate(
                self.bus.node_speed(session.node),
                self.config.max_speed,
                session.device_max_rec,
                self.bus.max_rec(),
                self.config.max_payload_ceiling,
            );
            session.speed = speed;
            session.max_payload = max_payload;
            (session.node, session.generation, session.command_agent)
        };

        let retries = self.config.transport_retries;
        let busy_timeout = defs::BUSY_TIMEOUT_VALUE.to_be_bytes();
        if let Err(e) =
            write_with_retries(self.bus.as_ref(), node, generation, defs::CSR_BUSY_TIMEOUT, &busy_timeout, retries).await
        {
            log::debug!("[SBP2] session {}: BUSY_TIMEOUT write failed: {}", handle.slot, e);
        }
        if let Err(e) =
            write_with_retries(self.bus.as_ref(), node, generation, command_agent + agent::AGENT_RESET, &[0; 4], retries)
                .await
        {
            log::warn!("[SBP2] session {}: agent reset failed: {}", handle.slot, e);
        }

        let finished = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(handle) else { return };
            if session.transition(SessionState::Active).is_err() {
                return;
            }
            session.validation = Validation::Confirmed;
            session.agent_reset_deferred = false;
            log::info!(
                "[SBP2] session {}: active ({:?}, max payload {} bytes)",
                handle.slot,
                session.speed,
                max_payload_bytes(session.max_payload)
            );
            // リセット前に発行したコマンドは再送してもらう
            session.orbs.retire_all(CommandResult::BusyRetry)
        };
        self.complete_all(finished);
    }

    /// 確認されなかったセッションを破棄する
    fn destroy_stale(&self) {
        let stale: Vec<SessionHandle> = {
            let inner = self.inner.lock();
            inner.sessions.iter().filter(|s| s.validation == Validation::Stale).map(|s| s.handle).collect()
        };
        for handle in stale {
            log::info!("[SBP2] session {}: device gone", handle.slot);
            self.destroy_session(handle, CommandResult::NoConnection);
        }
    }

    /// セッションを外して資源を返す
    pub(super) fn destroy_session(&self, handle: SessionHandle, result: CommandResult) {
        let (session, finished) = {
            let mut inner = self.inner.lock();
            let Some(mut session) = inner.sessions.remove(handle) else { return };
            let finished = session.orbs.retire_all(result);
            let _ = session.transition(SessionState::Closed);
            (session, finished)
        };
        self.bus.unregister_status_sink(self.status_range(handle.slot as usize));
        self.complete_all(finished);
        session.teardown(self.dma.as_ref());
    }

    /// ベストエフォートのログアウト。必ず解体が続く
    pub async fn logout_session(&self, handle: SessionHandle) {
        let logout = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.sessions.get_mut(handle) else { return };
            let logged_in = session.state() == SessionState::Active;
            match session.login_id {
                Some(login_id) if logged_in => {
                    let _ = session.transition(SessionState::LoggingOut);
                    let target = session.management_target(
                        self.bus.as_ref(),
                        self.dma.as_ref(),
                        self.timer.as_ref(),
                        self.config.transport_retries,
                    );
                    Some((session.management.clone(), target, login_id))
                }
                _ => None,
            }
        };

        if let Some((management, target, login_id)) = logout {
            if let Err(e) = management.logout(&target, login_id, self.config.logout_timeout_ms).await {
                log::debug!("[SBP2] session {}: logout not acknowledged: {}", handle.slot, e);
            }
        }
        self.destroy_session(handle, CommandResult::NoConnection);
    }

    /// アダプタの取り外し: 全セッションをログアウトし、保留コマンドを終わらせる
    pub async fn shutdown(&self) {
        let (pending, handles) = {
            let mut inner = self.inner.lock();
            inner.removed = true;
            (core::mem::take(&mut inner.pending), inner.sessions.handles())
        };
        for p in pending {
            (p.callback)(p.command.id, CommandResult::NoConnection);
        }
        for handle in handles {
            self.logout_session(handle).await;
        }
        // ワーカーを起こして終了させる
        self.signal.notify();
        log::info!("[SBP2] adapter {} removed", self.id);
    }
}
