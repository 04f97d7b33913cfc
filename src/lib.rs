// ============================================================================
// src/lib.rs - SBP-2 Storage Transport
// ============================================================================
//!
//! # シリアルバス・ストレージトランスポート (SBP-2)
//!
//! パケット交換型ペリフェラルバス上のストレージデバイスを、
//! 汎用SCSIコマンド層へ公開するトランスポートドライバ。
//!
//! ## アーキテクチャ
//! ```text
//!  汎用コマンド層 ── submit / abort / reset ──┐
//!                                              v
//!  host::HostAdapter ── セッション表 + 保留キュー (アダプタロック)
//!        │                    │
//!        │ バスリセット        │ ORB発行 (ポインタ書き込み / ドアベル)
//!        v                    v
//!  sbp2::discovery      sbp2::translate ── sbp2::orb_pool
//!  sbp2::session              │
//!        │                    v
//!        └────────── bus::BusTransport ── sbp2::packet_pool
//!                             │
//!                  ステータス書き込み (非同期)
//!                             v
//!                    sbp2::completion
//! ```
//!
//! ## 外部コラボレータ
//! - `bus`: バストランザクション層（ノード列挙、世代番号、リセット通知）
//! - `dma`: DMAアドレス変換とコヒーレントメモリ
//! - `time`: タイマー（ログイン待ちの有界スリープ）
//!
//! ハードウェアには直接触れない。すべてトレイト越しに受け取る。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod config;
pub mod dma;
pub mod error;
pub mod host;
pub mod sbp2;
pub mod scsi;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;

pub use config::DriverConfig;
pub use error::{Sbp2Error, Sbp2Result};
pub use host::{
    AbortOutcome, ExportedDevice, HostAdapter, HostAdapterRegistry, SubmitRejected, adapter_registry,
};
pub use scsi::{CommandId, CommandResult, CompletionCallback, DataBuffer, ScsiCommand, SenseData};
pub use sbp2::session::{SessionHandle, SessionState};
