// ============================================================================
// src/sbp2/mod.rs - Serial Bus Protocol 2
// ============================================================================
//!
//! # SBP-2 プロトコル層
//!
//! ## モジュール構成
//! - `defs`: アドレス・キー・既定値
//! - `config_rom`: 自己記述ディレクトリ
//! - `orb`: ORB / ログイン応答 / ページテーブルのワイヤ形式
//! - `status`: ステータスブロックとセンス変換
//! - `quirks`: デバイス固有の回避策
//! - `packet_pool`: 要求パケットプール
//! - `orb_pool`: セッション毎のコマンド記述子プール
//! - `session`: ログイン/再接続/ログアウト
//! - `discovery`: バスリセット後のトポロジ走査
//! - `translate`: SCSIコマンド -> ORB 変換と分割
//! - `completion`: ステータス書き込みの振り分け

pub mod completion;
pub mod config_rom;
pub mod defs;
pub mod discovery;
pub mod orb;
pub mod orb_pool;
pub mod packet_pool;
pub mod quirks;
pub mod session;
pub mod status;
pub mod translate;

pub use quirks::Quirks;
pub use session::{SessionHandle, SessionState};
