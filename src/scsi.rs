// ============================================================================
// src/scsi.rs - Generic SCSI Command Layer Types
// ============================================================================
//!
//! # 汎用SCSIコマンド層との境界
//!
//! 汎用コマンド層（ブロック層のキューイング・フロントエンド）から
//! 受け取るコマンドと、返す完了結果の型。
//!
//! ## 参照仕様
//! - SCSI Primary Commands (SPC)
//! - SCSI Block Commands (SBC)
//! - Reduced Block Commands (RBC)

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::dma::{DataDirection, SgSegment};
use crate::sbp2::session::SessionHandle;

// ============================================================================
// SCSI Commands
// ============================================================================

/// SCSI オペレーションコード
pub mod opcode {
    /// TEST UNIT READY
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// REQUEST SENSE
    pub const REQUEST_SENSE: u8 = 0x03;
    /// READ (6)
    pub const READ_6: u8 = 0x08;
    /// WRITE (6)
    pub const WRITE_6: u8 = 0x0A;
    /// INQUIRY
    pub const INQUIRY: u8 = 0x12;
    /// MODE SELECT (6)
    pub const MODE_SELECT_6: u8 = 0x15;
    /// MODE SENSE (6)
    pub const MODE_SENSE_6: u8 = 0x1A;
    /// START STOP UNIT
    pub const START_STOP_UNIT: u8 = 0x1B;
    /// READ CAPACITY (10)
    pub const READ_CAPACITY_10: u8 = 0x25;
    /// READ (10)
    pub const READ_10: u8 = 0x28;
    /// WRITE (10)
    pub const WRITE_10: u8 = 0x2A;
    /// SYNCHRONIZE CACHE (10)
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    /// MODE SELECT (10)
    pub const MODE_SELECT_10: u8 = 0x55;
    /// MODE SENSE (10)
    pub const MODE_SENSE_10: u8 = 0x5A;
    /// READ (12)
    pub const READ_12: u8 = 0xA8;
    /// WRITE (12)
    pub const WRITE_12: u8 = 0xAA;
    /// READ (16)
    pub const READ_16: u8 = 0x88;
    /// WRITE (16)
    pub const WRITE_16: u8 = 0x8A;
}

/// SCSI ステータスバイト
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
}

/// SCSI Sense Key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    VendorSpecific = 0x09,
    CopyAborted = 0x0A,
    AbortedCommand = 0x0B,
    VolumeOverflow = 0x0D,
    Miscompare = 0x0E,
}

impl SenseKey {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x00 => Some(Self::NoSense),
            0x01 => Some(Self::RecoveredError),
            0x02 => Some(Self::NotReady),
            0x03 => Some(Self::MediumError),
            0x04 => Some(Self::HardwareError),
            0x05 => Some(Self::IllegalRequest),
            0x06 => Some(Self::UnitAttention),
            0x07 => Some(Self::DataProtect),
            0x08 => Some(Self::BlankCheck),
            0x09 => Some(Self::VendorSpecific),
            0x0A => Some(Self::CopyAborted),
            0x0B => Some(Self::AbortedCommand),
            0x0D => Some(Self::VolumeOverflow),
            0x0E => Some(Self::Miscompare),
            _ => None,
        }
    }
}

// ============================================================================
// Command Descriptor Block
// ============================================================================

/// CDB (Command Descriptor Block)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; 16],
    len: u8,
}

impl Cdb {
    /// バイト列からCDBを作成（最大16バイト）
    pub fn from_slice(bytes: &[u8]) -> Self {
        let len = bytes.len().min(16);
        let mut cdb = Self { bytes: [0; 16], len: len as u8 };
        cdb.bytes[..len].copy_from_slice(&bytes[..len]);
        cdb
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// READ/WRITE 系か
    pub fn is_read_write(&self) -> bool {
        matches!(
            self.opcode(),
            opcode::READ_6
                | opcode::WRITE_6
                | opcode::READ_10
                | opcode::WRITE_10
                | opcode::READ_12
                | opcode::WRITE_12
                | opcode::READ_16
                | opcode::WRITE_16
        )
    }

    /// READ/WRITE の (LBA, ブロック数) を取り出す
    pub fn block_range(&self) -> Option<(u64, u32)> {
        let b = &self.bytes;
        match self.opcode() {
            opcode::READ_6 | opcode::WRITE_6 => {
                let lba = (((b[1] & 0x1F) as u64) << 16) | ((b[2] as u64) << 8) | b[3] as u64;
                // 転送長0は256ブロック
                let count = if b[4] == 0 { 256 } else { b[4] as u32 };
                Some((lba, count))
            }
            opcode::READ_10 | opcode::WRITE_10 => {
                let lba = u32::from_be_bytes([b[2], b[3], b[4], b[5]]) as u64;
                let count = u16::from_be_bytes([b[7], b[8]]) as u32;
                Some((lba, count))
            }
            opcode::READ_12 | opcode::WRITE_12 => {
                let lba = u32::from_be_bytes([b[2], b[3], b[4], b[5]]) as u64;
                let count = u32::from_be_bytes([b[6], b[7], b[8], b[9]]);
                Some((lba, count))
            }
            opcode::READ_16 | opcode::WRITE_16 if self.len >= 16 => {
                let lba = u64::from_be_bytes([b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9]]);
                let count = u32::from_be_bytes([b[10], b[11], b[12], b[13]]);
                Some((lba, count))
            }
            _ => None,
        }
    }

    /// 同じオペコードで (LBA, ブロック数) を差し替えたCDB
    pub fn with_block_range(&self, lba: u64, count: u32) -> Self {
        let mut cdb = *self;
        let b = &mut cdb.bytes;
        match self.opcode() {
            opcode::READ_6 | opcode::WRITE_6 => {
                b[1] = (b[1] & 0xE0) | ((lba >> 16) as u8 & 0x1F);
                b[2] = (lba >> 8) as u8;
                b[3] = lba as u8;
                b[4] = if count >= 256 { 0 } else { count as u8 };
            }
            opcode::READ_10 | opcode::WRITE_10 => {
                b[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
                b[7..9].copy_from_slice(&(count as u16).to_be_bytes());
            }
            opcode::READ_12 | opcode::WRITE_12 => {
                b[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
                b[6..10].copy_from_slice(&count.to_be_bytes());
            }
            opcode::READ_16 | opcode::WRITE_16 => {
                b[2..10].copy_from_slice(&lba.to_be_bytes());
                b[10..14].copy_from_slice(&count.to_be_bytes());
            }
            _ => {}
        }
        cdb
    }
}

// ============================================================================
// Sense Data
// ============================================================================

/// 固定形式センスデータ（18バイト）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData(pub [u8; SenseData::LEN]);

impl SenseData {
    pub const LEN: usize = 18;

    /// 応答コード 0x70（カレントエラー）
    pub const CURRENT_ERROR: u8 = 0x70;
    /// 応答コード 0x71（遅延エラー）
    pub const DEFERRED_ERROR: u8 = 0x71;

    pub fn sense_key(&self) -> Option<SenseKey> {
        SenseKey::from_u8(self.0[2])
    }

    pub fn asc(&self) -> u8 {
        self.0[12]
    }

    pub fn ascq(&self) -> u8 {
        self.0[13]
    }

    pub fn information(&self) -> u32 {
        u32::from_be_bytes([self.0[3], self.0[4], self.0[5], self.0[6]])
    }
}

// ============================================================================
// Commands and Completions
// ============================================================================

/// 汎用層が割り当てるコマンド識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

/// データバッファ（マッピング前）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub direction: DataDirection,
    pub segments: Vec<SgSegment>,
}

impl DataBuffer {
    /// データフェーズなし
    pub fn none() -> Self {
        Self { direction: DataDirection::None, segments: Vec::new() }
    }

    pub fn new(direction: DataDirection, segments: Vec<SgSegment>) -> Self {
        Self { direction, segments }
    }

    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len as u64).sum()
    }

    pub fn has_data(&self) -> bool {
        self.direction != DataDirection::None && self.total_len() > 0
    }
}

/// 汎用層から渡されるSCSIコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCommand {
    pub id: CommandId,
    pub target: SessionHandle,
    pub cdb: Cdb,
    pub data: DataBuffer,
}

impl ScsiCommand {
    pub fn new(id: CommandId, target: SessionHandle, cdb: &[u8], data: DataBuffer) -> Self {
        Self { id, target, cdb: Cdb::from_slice(cdb), data }
    }
}

/// コマンドの完了結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    /// 成功
    Good,
    /// デバイスがエラーを報告した（センスデータ付き）
    CheckCondition { status: u8, sense: SenseData },
    /// デバイスが居なくなった
    NoConnection,
    /// バスリセット等で破棄された。再送すべき
    BusyRetry,
    /// 未発行のまま中止された
    Aborted,
    /// トランザクション層のエラー
    TransportError,
}

impl CommandResult {
    pub fn is_good(&self) -> bool {
        matches!(self, CommandResult::Good)
    }
}

/// 完了コールバック
///
/// `FnOnce` なので型で「ちょうど一度」を保証する。
pub type CompletionCallback = Box<dyn FnOnce(CommandId, CommandResult) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read10_block_range() {
        let cdb = Cdb::from_slice(&[opcode::READ_10, 0, 0, 0, 0x10, 0x00, 0, 0x01, 0x2C, 0]);
        assert_eq!(cdb.block_range(), Some((0x1000, 300)));

        let frag = cdb.with_block_range(0x1080, 128);
        assert_eq!(frag.block_range(), Some((0x1080, 128)));
        assert_eq!(frag.opcode(), opcode::READ_10);
        assert_eq!(frag.len(), 10);
    }

    #[test]
    fn test_read16_block_range() {
        let mut raw = [0u8; 16];
        raw[0] = opcode::READ_16;
        raw[2..10].copy_from_slice(&0x1_0000_0000u64.to_be_bytes());
        raw[10..14].copy_from_slice(&3000u32.to_be_bytes());
        let cdb = Cdb::from_slice(&raw);
        assert!(cdb.is_read_write());
        assert_eq!(cdb.block_range(), Some((0x1_0000_0000, 3000)));

        let frag = cdb.with_block_range(0x1_0000_0080, 128);
        assert_eq!(frag.block_range(), Some((0x1_0000_0080, 128)));
        assert_eq!(frag.len(), 16);

        // 切り詰められた16バイトCDBは範囲を持たない
        assert_eq!(Cdb::from_slice(&raw[..10]).block_range(), None);
    }

    #[test]
    fn test_read6_zero_means_256() {
        let cdb = Cdb::from_slice(&[opcode::READ_6, 0x01, 0x02, 0x03, 0, 0]);
        assert_eq!(cdb.block_range(), Some((0x010203, 256)));
    }

    #[test]
    fn test_non_rw_has_no_range() {
        let cdb = Cdb::from_slice(&[opcode::INQUIRY, 0, 0, 0, 36, 0]);
        assert!(!cdb.is_read_write());
        assert_eq!(cdb.block_range(), None);
    }

    #[test]
    fn test_sense_accessors() {
        let mut raw = [0u8; SenseData::LEN];
        raw[0] = SenseData::CURRENT_ERROR;
        raw[2] = 0x05;
        raw[12] = 0x24;
        let sense = SenseData(raw);
        assert_eq!(sense.sense_key(), Some(SenseKey::IllegalRequest));
        assert_eq!(sense.asc(), 0x24);
    }
}
