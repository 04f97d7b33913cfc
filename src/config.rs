// ============================================================================
// src/config.rs - Driver Configuration
// ============================================================================
//!
//! モジュールパラメータ相当のドライバ設定。
//! 既定値は `sbp2::defs` の定数。

use crate::bus::BusSpeed;
use crate::sbp2::Quirks;
use crate::sbp2::defs;

/// ドライバ設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// 使用する最大速度
    pub max_speed: BusSpeed,
    /// max_payload の上限（バイト）
    pub max_payload_ceiling: u32,
    /// 排他ログインを要求する
    pub exclusive_login: bool,
    /// セッション当たりのコマンド記述子数
    pub orbs_per_session: usize,
    /// アダプタ当たりの要求パケット数
    pub request_packets: usize,
    /// 転送制限付きデバイスの1コマンド最大ブロック数
    pub limited_max_blocks: u32,
    /// ステータスFIFOを置くホストアドレス
    pub status_fifo_base: u64,
    /// 回避策の上書き（`Some` なら表を引かない）
    pub workaround_overrides: Option<Quirks>,
    pub login_timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub logout_timeout_ms: u64,
    /// バスリセット後の待ち
    pub settle_delay_ms: u64,
    /// `reset()` の排出待ち
    pub reset_wait_ms: u64,
    /// トランザクションの再試行回数
    pub transport_retries: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_speed: BusSpeed::S800,
            max_payload_ceiling: 4096,
            exclusive_login: true,
            orbs_per_session: defs::DEFAULT_ORBS_PER_SESSION,
            request_packets: defs::DEFAULT_REQUEST_PACKETS,
            limited_max_blocks: defs::DEFAULT_LIMITED_MAX_BLOCKS,
            status_fifo_base: defs::DEFAULT_STATUS_FIFO_BASE,
            workaround_overrides: None,
            login_timeout_ms: defs::LOGIN_TIMEOUT_MS,
            reconnect_timeout_ms: defs::RECONNECT_TIMEOUT_MS,
            logout_timeout_ms: defs::LOGOUT_TIMEOUT_MS,
            settle_delay_ms: defs::SETTLE_DELAY_MS,
            reset_wait_ms: defs::RESET_WAIT_MS,
            transport_retries: defs::TRANSPORT_RETRIES,
        }
    }
}

impl DriverConfig {
    /// 設定値の整合性を確認する
    pub fn validate(&self) -> Result<(), crate::error::GeneralError> {
        use crate::error::GeneralError;
        if self.orbs_per_session == 0 || self.request_packets == 0 || self.limited_max_blocks == 0 {
            return Err(GeneralError::InvalidArgument);
        }
        if self.max_payload_ceiling < 4 {
            return Err(GeneralError::InvalidArgument);
        }
        if self.status_fifo_base >> 48 != 0 {
            return Err(GeneralError::InvalidArgument);
        }
        Ok(())
    }

    /// スロット毎のステータスFIFOアドレス
    pub fn status_fifo_for(&self, slot: usize) -> u64 {
        self.status_fifo_base + slot as u64 * defs::STATUS_FIFO_STRIDE
    }
}
