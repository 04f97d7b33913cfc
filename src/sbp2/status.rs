// ============================================================================
// src/sbp2/status.rs - Status Block
// ============================================================================
//!
//! # ステータスブロック
//!
//! デバイスがホストのステータスFIFOに書き込む最大32バイトの完了報告。
//!
//! ```text
//! +0  [src:2|resp:2|dead:1|len:3|sbp_status:8|orb_offset_hi:16]
//! +4  [orb_offset_lo:32]
//! +8  コマンドセット依存（SCSI: status, sense key, ASC/ASCQ, information ...）
//! ```

use super::defs;
use super::orb::wire_to_quadlets;
use crate::scsi::{CommandResult, SenseData, status};

/// resp フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Response {
    /// 要求完了
    RequestComplete = 0,
    /// トランスポート障害
    TransportFailure = 1,
    /// 不正な要求
    IllegalRequest = 2,
    /// ベンダー依存
    VendorDependent = 3,
}

impl Response {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::RequestComplete,
            1 => Self::TransportFailure,
            2 => Self::IllegalRequest,
            _ => Self::VendorDependent,
        }
    }
}

/// src フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    /// ORBに対するステータス（ORBは次を指す）
    OrbNext,
    /// ORBに対するステータス（チェーン末尾）
    OrbNull,
    /// 非要求ステータス
    Unsolicited,
    Reserved,
}

/// ステータスブロック
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBlock {
    raw: [u8; defs::STATUS_BLOCK_SIZE],
    /// 実際に書き込まれたバイト数
    written: usize,
}

impl StatusBlock {
    /// ステータスFIFOへの書き込みから構築（8バイト未満は不正）
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        let written = bytes.len().min(defs::STATUS_BLOCK_SIZE);
        let mut raw = [0u8; defs::STATUS_BLOCK_SIZE];
        raw[..written].copy_from_slice(&bytes[..written]);
        Some(Self { raw, written })
    }

    fn header(&self) -> [u32; 2] {
        let mut q = [0u32; 2];
        wire_to_quadlets(&self.raw[..8], &mut q);
        q
    }

    pub fn source(&self) -> StatusSource {
        match self.raw[0] >> 6 {
            0 => StatusSource::OrbNext,
            1 => StatusSource::OrbNull,
            2 => StatusSource::Unsolicited,
            _ => StatusSource::Reserved,
        }
    }

    pub fn response(&self) -> Response {
        Response::from_bits(self.raw[0] >> 4)
    }

    /// フェッチエージェントが dead 状態に入った
    pub fn is_dead(&self) -> bool {
        self.raw[0] & 0x08 != 0
    }

    /// 有効なクワッドレット数
    pub fn quadlets(&self) -> usize {
        ((self.raw[0] & 0x07) as usize + 1).min(self.written / 4)
    }

    pub fn sbp_status(&self) -> u8 {
        self.raw[1]
    }

    /// 報告対象ORBのアドレス（48ビット）
    pub fn orb_offset(&self) -> u64 {
        let [hi, lo] = self.header();
        (((hi & 0xFFFF) as u64) << 32) | lo as u64
    }

    /// ORBアドレスの下位32ビット（記述子照合に使う）
    pub fn orb_offset_lo(&self) -> u32 {
        self.header()[1]
    }

    /// コマンドセット依存部分があるか
    pub fn has_command_set_data(&self) -> bool {
        self.quadlets() > 2
    }

    /// SCSIステータスバイト
    pub fn scsi_status(&self) -> u8 {
        self.raw[8] & 0x3F
    }

    /// 固定形式センスデータへ変換
    pub fn to_sense(&self) -> SenseData {
        let s = &self.raw;
        let mut sense = [0u8; SenseData::LEN];
        // sfmt: 0 = カレント、1 = 遅延
        let code = if s[8] >> 6 == 1 { SenseData::DEFERRED_ERROR } else { SenseData::CURRENT_ERROR };
        // s[9]: valid | mark | eom | ili | sense_key
        sense[0] = code | (s[9] & 0x80);
        sense[2] = ((s[9] << 1) & 0xE0) | (s[9] & 0x0F);
        sense[3..7].copy_from_slice(&s[12..16]);
        sense[7] = 10;
        sense[8..12].copy_from_slice(&s[16..20]);
        sense[12] = s[10];
        sense[13] = s[11];
        sense[14..16].copy_from_slice(&s[20..22]);
        SenseData(sense)
    }

    /// フェッチエージェントのリセットが必要か
    pub fn needs_agent_reset(&self) -> bool {
        self.is_dead() || self.is_check_condition()
    }

    fn is_check_condition(&self) -> bool {
        self.response() == Response::RequestComplete
            && self.has_command_set_data()
            && self.scsi_status() != status::GOOD
    }

    /// 汎用層への完了結果
    pub fn to_command_result(&self) -> CommandResult {
        if self.response() != Response::RequestComplete || self.sbp_status() != 0 {
            return CommandResult::TransportError;
        }
        if self.is_check_condition() {
            return CommandResult::CheckCondition { status: self.scsi_status(), sense: self.to_sense() };
        }
        if self.is_dead() {
            return CommandResult::TransportError;
        }
        CommandResult::Good
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw[..self.written]
    }
}

/// ステータスブロックをワイヤ形式で組み立てる（エミュレーションとテスト用）
pub fn encode_status(
    resp: Response,
    dead: bool,
    orb: u64,
    command_set: Option<&[u8]>,
) -> alloc::vec::Vec<u8> {
    let extra = command_set.map(|d| d.len().min(defs::STATUS_BLOCK_SIZE - 8)).unwrap_or(0);
    let quadlets = 2 + extra.div_ceil(4);
    let q0 = (1u32 << 30)
        | ((resp as u32) << 28)
        | ((dead as u32) << 27)
        | (((quadlets - 1) as u32 & 0x7) << 24)
        | ((orb >> 32) as u32 & 0xFFFF);
    let mut out = alloc::vec![0u8; quadlets * 4];
    out[0..4].copy_from_slice(&q0.to_be_bytes());
    out[4..8].copy_from_slice(&(orb as u32).to_be_bytes());
    if let Some(data) = command_set {
        out[8..8 + extra].copy_from_slice(&data[..extra]);
    }
    out
}
