// ============================================================================
// src/sbp2/defs.rs - SBP-2 Common Definitions
// ============================================================================
//!
//! SBP-2 共通定数
//!
//! IEEE 1212 CSR アーキテクチャと SBP-2 に基づくアドレス・キー・既定値。

#![allow(dead_code)]

// ============================================================================
// CSR Address Space
// ============================================================================

/// CSR レジスタ空間のベース
pub const CSR_REGISTER_BASE: u64 = 0xFFFF_F000_0000;

/// BUSY_TIMEOUT レジスタ
pub const CSR_BUSY_TIMEOUT: u64 = CSR_REGISTER_BASE + 0x210;

/// Config ROM のベース
pub const CONFIG_ROM_BASE: u64 = CSR_REGISTER_BASE + 0x400;

/// バス名 "1394" が置かれるアドレス（シグネチャ）
pub const BUS_INFO_SIGNATURE_ADDR: u64 = CONFIG_ROM_BASE + 4;

/// バス名シグネチャ
pub const BUS_INFO_SIGNATURE: u32 = 0x3133_3934;

/// バス情報ブロックの長さ（クワッドレット、ヘッダ含む）
pub const BUS_INFO_QUADLETS: u32 = 5;

/// ルートディレクトリの位置
pub const ROOT_DIRECTORY_ADDR: u64 = CONFIG_ROM_BASE + (BUS_INFO_QUADLETS as u64) * 4;

/// BUSY_TIMEOUT に書く値（再試行限界を最大に）
pub const BUSY_TIMEOUT_VALUE: u32 = 0x0000_000F;

// ============================================================================
// Config ROM Keys
// ============================================================================

/// ディレクトリのキー（種別2ビット + ID6ビット）
pub mod key {
    /// ベンダーID（即値）
    pub const VENDOR_ID: u8 = 0x03;
    /// ノード能力（即値）
    pub const NODE_CAPABILITIES: u8 = 0x0C;
    /// 論理ユニット番号（即値: デバイス種別 + LUN）
    pub const LOGICAL_UNIT_NUMBER: u8 = 0x14;
    /// モデルID（即値）
    pub const MODEL_ID: u8 = 0x17;
    /// ユニット仕様ID（即値）
    pub const UNIT_SPEC_ID: u8 = 0x12;
    /// ユニットソフトウェアバージョン（即値）
    pub const UNIT_SW_VERSION: u8 = 0x13;
    /// コマンドセット仕様ID（即値）
    pub const COMMAND_SET_SPEC_ID: u8 = 0x38;
    /// コマンドセット（即値）
    pub const COMMAND_SET: u8 = 0x39;
    /// ユニット特性（即値）
    pub const UNIT_CHARACTERISTICS: u8 = 0x3A;
    /// コマンドセットリビジョン（即値）
    pub const COMMAND_SET_REVISION: u8 = 0x3B;
    /// ファームウェアリビジョン（即値）
    pub const FIRMWARE_REVISION: u8 = 0x3C;
    /// 管理エージェント（CSRオフセット）
    pub const MANAGEMENT_AGENT: u8 = 0x54;
    /// ユニットディレクトリ（ディレクトリ）
    pub const UNIT_DIRECTORY: u8 = 0xD1;
    /// 論理ユニットディレクトリ（ディレクトリ）
    pub const LOGICAL_UNIT_DIRECTORY: u8 = 0xD4;
}

/// ストレージプロトコルの仕様ID
pub const SBP2_UNIT_SPEC_ID: u32 = 0x00_609E;

/// ストレージプロトコルのソフトウェアバージョン
pub const SBP2_SW_VERSION: u32 = 0x01_0483;

/// コマンドセット: SCSI Primary Commands 2
pub const SCSI_COMMAND_SET: u32 = 0x01_04D8;

/// デバイス種別: RBC (Reduced Block Commands)
pub const DEVICE_TYPE_RBC: u8 = 0x0E;

/// デバイス種別: ダイレクトアクセス（ディスク）
pub const DEVICE_TYPE_DISK: u8 = 0x00;

// ============================================================================
// Agent Registers
// ============================================================================

/// コマンドブロックエージェントのレジスタオフセット
pub mod agent {
    /// AGENT_STATE
    pub const AGENT_STATE: u64 = 0x00;
    /// AGENT_RESET
    pub const AGENT_RESET: u64 = 0x04;
    /// ORB_POINTER（8バイト）
    pub const ORB_POINTER: u64 = 0x08;
    /// DOORBELL
    pub const DOORBELL: u64 = 0x10;
    /// UNSOLICITED_STATUS_ENABLE
    pub const UNSOLICITED_STATUS_ENABLE: u64 = 0x14;
}

// ============================================================================
// Sizes
// ============================================================================

/// コマンドORBのサイズ（バイト）
pub const COMMAND_ORB_SIZE: usize = 32;

/// CDB領域のサイズ
pub const CDB_AREA_SIZE: usize = 12;

/// 管理ORBのサイズ（ログイン/再接続/ログアウト）
pub const MANAGEMENT_ORB_SIZE: usize = 32;

/// ログイン応答のサイズ
pub const LOGIN_RESPONSE_SIZE: usize = 16;

/// ステータスブロックの最大サイズ
pub const STATUS_BLOCK_SIZE: usize = 32;

/// ページテーブルエントリのサイズ
pub const PAGE_TABLE_ENTRY_SIZE: usize = 8;

/// ページテーブル1要素の最大長
pub const MAX_PAGE_TABLE_ELEMENT_LEN: u32 = 0xF000;

/// ORB毎のページテーブルエントリ数
pub const PAGE_TABLE_ENTRIES: usize = 128;

/// ORBのデータサイズフィールドの最大値
pub const MAX_DATA_SIZE: u32 = 0xFFFF;

// ============================================================================
// Defaults (module parameters)
// ============================================================================

/// アダプタ当たりの最大セッション数
pub const MAX_SESSIONS: usize = 16;

/// セッション当たりのコマンドORB数
pub const DEFAULT_ORBS_PER_SESSION: usize = 16;

/// アダプタ当たりの要求パケット数
pub const DEFAULT_REQUEST_PACKETS: usize = 32;

/// 転送制限付きデバイスの1コマンド当たり最大ブロック数
pub const DEFAULT_LIMITED_MAX_BLOCKS: u32 = 128;

/// ステータスFIFO領域のベース（ホストアドレス空間）
pub const DEFAULT_STATUS_FIFO_BASE: u64 = 0x0001_0000_0000;

/// セッション毎のステータスFIFO間隔
pub const STATUS_FIFO_STRIDE: u64 = 0x100;

/// ログインのタイムアウト（ミリ秒）
pub const LOGIN_TIMEOUT_MS: u64 = 20_000;

/// 再接続のタイムアウト（ミリ秒）
pub const RECONNECT_TIMEOUT_MS: u64 = 1_000;

/// ログアウトのタイムアウト（ミリ秒）
pub const LOGOUT_TIMEOUT_MS: u64 = 1_000;

/// 管理ステータスの再確認間隔（ミリ秒）
pub const MANAGEMENT_POLL_INTERVAL_MS: u64 = 10;

/// バスリセット後の電気的回復待ち（ミリ秒）
pub const SETTLE_DELAY_MS: u64 = 100;

/// reset() が記述子の排出を待つ時間（ミリ秒）
pub const RESET_WAIT_MS: u64 = 2_000;

/// トランザクションの再試行回数
pub const TRANSPORT_RETRIES: u32 = 3;

/// ユニット特性の管理タイムアウト単位（ミリ秒）
pub const MGMT_TIMEOUT_UNIT_MS: u64 = 500;
