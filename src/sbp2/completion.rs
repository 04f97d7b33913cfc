// ============================================================================
// src/sbp2/completion.rs - Completion Router
// ============================================================================
//!
//! # 完了ルータ
//!
//! デバイスがステータスFIFOに書き込んだステータスブロックを振り分ける。
//! バス層の配送コンテキストから、アダプタロック下で呼ばれる。
//! スリープもバス操作もしない。結果（完了したリクエスト、
//! フェッチエージェントリセットの要否）を呼び出し側に返し、
//! 呼び出し側がロックを離してから処理する。

use alloc::vec::Vec;

use super::defs::agent;
use super::orb_pool::{FinishedRequest, StatusMatch};
use super::session::DeviceSession;
use super::status::{StatusBlock, StatusSource};
use crate::scsi::CommandResult;

/// 振り分け結果
pub enum RouteOutcome {
    /// 管理ORBのステータスとしてメールボックスに置いた
    Management,
    /// 一致するものがなく破棄した
    Dropped,
    /// コマンド記述子を解放した
    Completed {
        finished: Vec<FinishedRequest>,
        /// 書き込むべき AGENT_RESET レジスタのアドレス
        agent_reset: Option<u64>,
    },
}

/// セッション宛てのステータス書き込みを処理する
pub fn route_status(session: &mut DeviceSession, data: &[u8]) -> RouteOutcome {
    let Some(status) = StatusBlock::from_wire(data) else {
        log::warn!("[SBP2] session {}: short status write ({} bytes)", session.handle.slot, data.len());
        return RouteOutcome::Dropped;
    };

    if session.management.deliver(&status) {
        return RouteOutcome::Management;
    }
    if session.management.owns(&status) {
        log::debug!("[SBP2] session {}: late management status dropped", session.handle.slot);
        return RouteOutcome::Dropped;
    }
    if status.source() == StatusSource::Unsolicited {
        log::debug!("[SBP2] session {}: unsolicited status dropped", session.handle.slot);
        return RouteOutcome::Dropped;
    }

    let result = status.to_command_result();
    let mut finished = Vec::new();
    match session.orbs.complete(status.orb_offset_lo(), result) {
        StatusMatch::Unmatched => {
            log::warn!(
                "[SBP2] session {}: status for unknown ORB {:#010x} dropped",
                session.handle.slot,
                status.orb_offset_lo()
            );
            return RouteOutcome::Dropped;
        }
        StatusMatch::Released => {}
        StatusMatch::Finished(f) => finished.push(f),
    }

    #[cfg(feature = "verbose_logging")]
    log::trace!(
        "[SBP2] session {}: status orb={:#010x} result={:?}",
        session.handle.slot,
        status.orb_offset_lo(),
        result
    );

    let mut agent_reset = None;
    if status.needs_agent_reset() {
        // エージェントのリセットでチェーン上の残りは破棄される
        log::debug!(
            "[SBP2] session {}: {} status, resetting fetch agent",
            session.handle.slot,
            if status.is_dead() { "dead" } else { "check condition" }
        );
        finished.extend(session.orbs.retire_all(CommandResult::BusyRetry));
        agent_reset = Some(session.agent_register(agent::AGENT_RESET));
    }

    RouteOutcome::Completed { finished, agent_reset }
}
