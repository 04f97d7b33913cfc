//! 統一エラーハンドリングモジュール
//!
//! ドライバ全体で使用される統一エラー型を定義し、
//! 各レイヤーのエラーから変換を提供します。

use core::fmt;

/// ドライバ全体の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sbp2Error {
    /// バストランザクションエラー
    Bus(BusError),
    /// DMA関連エラー
    Dma(DmaError),
    /// セッション関連エラー
    Session(SessionError),
    /// プール枯渇（バックプレッシャー）
    Pool(PoolError),
    /// 自己記述ディレクトリ（Config ROM）の解析エラー
    ConfigRom(ConfigRomError),
    /// 一般的なエラー
    General(GeneralError),
}

/// バストランザクションのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// 応答なし
    Timeout,
    /// 否定応答（ack_type_error 等）
    NegativeAck,
    /// 世代番号が一致しない（リセットを跨いだ）
    GenerationMismatch,
    /// アドレス範囲が既に使用中
    AddressInUse,
    /// ノードが存在しない
    NoSuchNode,
}

/// DMA関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// コヒーレントメモリの確保失敗
    AllocationFailed,
    /// スキャッタ/ギャザーのマッピング失敗
    MappingFailed,
    /// ページテーブルに収まらない
    TooManySegments,
}

/// セッション関連エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// 管理ステータスが時間内に届かなかった
    Timeout,
    /// ステータスのORBアドレスが一致しない、または応答が不正
    Mismatch,
    /// デバイスがログイン/再接続を拒否した
    Rejected,
    /// ハンドルが古い（セッションは既に破棄済み）
    StaleHandle,
    /// セッション表が満杯
    TableFull,
    /// 状態遷移が不正
    InvalidStateTransition,
    /// セッションがコマンドを受け付けない状態
    NotActive,
}

/// プール枯渇
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// 要求パケットプールが空
    Busy,
    /// コマンド記述子(ORB)が不足
    OutOfDescriptors,
}

/// 自己記述ディレクトリの解析エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRomError {
    /// バス情報ブロックのシグネチャが一致しない
    BadSignature,
    /// ディレクトリが読み取り範囲を超えている
    Truncated,
    /// エントリのオフセットが不正
    BadOffset,
    /// 必須キーがない
    MissingKey(u8),
}

/// 一般的なエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralError {
    /// 無効な引数
    InvalidArgument,
    /// サポートされていない操作
    NotSupported,
    /// リセット後も記述子が残っている
    OutstandingAfterReset,
    /// アダプタが見つからない
    NoSuchAdapter,
    /// 分割後のフラグメント数が記述子プールに収まらない
    TransferTooLarge,
}

/// ドライバ共通のResult
pub type Sbp2Result<T> = Result<T, Sbp2Error>;

// ===== Display implementations =====

impl fmt::Display for Sbp2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sbp2Error::Bus(e) => write!(f, "bus error: {}", e),
            Sbp2Error::Dma(e) => write!(f, "DMA error: {}", e),
            Sbp2Error::Session(e) => write!(f, "session error: {}", e),
            Sbp2Error::Pool(e) => write!(f, "pool error: {}", e),
            Sbp2Error::ConfigRom(e) => write!(f, "config ROM error: {}", e),
            Sbp2Error::General(e) => write!(f, "general error: {}", e),
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "transaction timeout"),
            BusError::NegativeAck => write!(f, "negative acknowledge"),
            BusError::GenerationMismatch => write!(f, "bus generation mismatch"),
            BusError::AddressInUse => write!(f, "address range in use"),
            BusError::NoSuchNode => write!(f, "no such node"),
        }
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaError::AllocationFailed => write!(f, "coherent allocation failed"),
            DmaError::MappingFailed => write!(f, "scatter/gather mapping failed"),
            DmaError::TooManySegments => write!(f, "too many scatter/gather segments"),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Timeout => write!(f, "management status timeout"),
            SessionError::Mismatch => write!(f, "management status mismatch"),
            SessionError::Rejected => write!(f, "request rejected by target"),
            SessionError::StaleHandle => write!(f, "stale session handle"),
            SessionError::TableFull => write!(f, "session table full"),
            SessionError::InvalidStateTransition => write!(f, "invalid state transition"),
            SessionError::NotActive => write!(f, "session not active"),
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Busy => write!(f, "request packet pool exhausted"),
            PoolError::OutOfDescriptors => write!(f, "command descriptors exhausted"),
        }
    }
}

impl fmt::Display for ConfigRomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigRomError::BadSignature => write!(f, "bus info block signature mismatch"),
            ConfigRomError::Truncated => write!(f, "directory truncated"),
            ConfigRomError::BadOffset => write!(f, "bad directory offset"),
            ConfigRomError::MissingKey(k) => write!(f, "missing key {:#04x}", k),
        }
    }
}

impl fmt::Display for GeneralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneralError::InvalidArgument => write!(f, "invalid argument"),
            GeneralError::NotSupported => write!(f, "not supported"),
            GeneralError::OutstandingAfterReset => write!(f, "descriptors outstanding after reset"),
            GeneralError::NoSuchAdapter => write!(f, "no such adapter"),
            GeneralError::TransferTooLarge => write!(f, "transfer needs more descriptors than the pool holds"),
        }
    }
}

// ===== From implementations for sub-errors =====

impl From<BusError> for Sbp2Error {
    fn from(e: BusError) -> Self {
        Sbp2Error::Bus(e)
    }
}

impl From<DmaError> for Sbp2Error {
    fn from(e: DmaError) -> Self {
        Sbp2Error::Dma(e)
    }
}

impl From<SessionError> for Sbp2Error {
    fn from(e: SessionError) -> Self {
        Sbp2Error::Session(e)
    }
}

impl From<PoolError> for Sbp2Error {
    fn from(e: PoolError) -> Self {
        Sbp2Error::Pool(e)
    }
}

impl From<ConfigRomError> for Sbp2Error {
    fn from(e: ConfigRomError) -> Self {
        Sbp2Error::ConfigRom(e)
    }
}

impl From<GeneralError> for Sbp2Error {
    fn from(e: GeneralError) -> Self {
        Sbp2Error::General(e)
    }
}

impl Sbp2Error {
    /// 再試行で回復し得るエラーか（バックプレッシャー/一時的なバス障害）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Sbp2Error::Pool(_)
                | Sbp2Error::Bus(BusError::Timeout)
                | Sbp2Error::Bus(BusError::GenerationMismatch)
        )
    }
}
