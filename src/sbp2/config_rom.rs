// ============================================================================
// src/sbp2/config_rom.rs - Self-Description Directory (Config ROM)
// ============================================================================
//!
//! # 自己記述ディレクトリ
//!
//! ノードが公開するConfig ROMの解析とエンコード。
//!
//! ## レイアウト
//! ```text
//! 0x400  バス情報ブロック  [info_len|crc_len|crc] ["1394"] [flags] [EUI-64 hi] [EUI-64 lo]
//! 0x414  ルートディレクトリ [length|crc] [key:8|value:24] ...
//!          └ 0xD1 ユニットディレクトリ -> [0x12 spec_id] [0x13 version] [0x54 mgmt] ...
//! ```
//! すべてビッグエンディアンのクワッドレット。

use alloc::vec::Vec;

use super::defs::{self, key};
use crate::bus::BusSpeed;
use crate::error::ConfigRomError;

// ============================================================================
// Key Types
// ============================================================================

/// エントリの種別（キーの上位2ビット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// 即値
    Immediate = 0,
    /// CSRオフセット
    CsrOffset = 1,
    /// リーフへのオフセット
    Leaf = 2,
    /// ディレクトリへのオフセット
    Directory = 3,
}

impl KeyType {
    pub fn from_key(key: u8) -> Self {
        match key >> 6 {
            0 => Self::Immediate,
            1 => Self::CsrOffset,
            2 => Self::Leaf,
            _ => Self::Directory,
        }
    }
}

// ============================================================================
// Directory Entry
// ============================================================================

/// ディレクトリエントリ（キー8ビット + 値24ビット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub key: u8,
    pub value: u32,
}

impl DirectoryEntry {
    pub fn new(key: u8, value: u32) -> Self {
        Self { key, value: value & 0x00FF_FFFF }
    }

    /// ホストオーダーのクワッドレットから
    pub fn decode(quadlet: u32) -> Self {
        Self { key: (quadlet >> 24) as u8, value: quadlet & 0x00FF_FFFF }
    }

    /// ホストオーダーのクワッドレットへ
    pub fn encode(&self) -> u32 {
        ((self.key as u32) << 24) | (self.value & 0x00FF_FFFF)
    }

    pub fn key_type(&self) -> KeyType {
        KeyType::from_key(self.key)
    }

    pub fn key_id(&self) -> u8 {
        self.key & 0x3F
    }

    /// オフセット型エントリの参照先アドレス
    ///
    /// `entry_addr` はこのエントリ自身のアドレス。
    pub fn target_address(&self, entry_addr: u64) -> Option<u64> {
        match self.key_type() {
            KeyType::Immediate => None,
            KeyType::CsrOffset => Some(defs::CSR_REGISTER_BASE + (self.value as u64) * 4),
            KeyType::Leaf | KeyType::Directory => Some(entry_addr + (self.value as u64) * 4),
        }
    }
}

// ============================================================================
// CRC
// ============================================================================

/// IEEE 1212 CRC-16（クワッドレット単位、4ビットずつ）
pub fn crc16(quadlets: &[u32]) -> u16 {
    let mut crc: u32 = 0;
    for &q in quadlets {
        let mut shift: i32 = 28;
        while shift >= 0 {
            let sum = ((crc >> 12) ^ (q >> shift)) & 0xF;
            crc = (crc << 4) ^ (sum << 12) ^ (sum << 5) ^ sum;
            shift -= 4;
        }
        crc &= 0xFFFF;
    }
    crc as u16
}

// ============================================================================
// Directory
// ============================================================================

/// ディレクトリヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryHeader {
    /// エントリ数（クワッドレット）
    pub length: u16,
    pub crc: u16,
}

impl DirectoryHeader {
    pub fn decode(quadlet: u32) -> Self {
        Self { length: (quadlet >> 16) as u16, crc: quadlet as u16 }
    }

    pub fn encode(&self) -> u32 {
        ((self.length as u32) << 16) | self.crc as u32
    }
}

/// 解析済みディレクトリ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    /// ディレクトリヘッダのアドレス
    pub base: u64,
    pub entries: Vec<DirectoryEntry>,
    /// CRCが一致したか（不一致でも解析は続ける）
    pub crc_ok: bool,
}

impl Directory {
    /// ヘッダとエントリ列（ホストオーダー）から構築
    pub fn parse(base: u64, header: u32, body: &[u32]) -> Result<Self, ConfigRomError> {
        let header = DirectoryHeader::decode(header);
        let len = header.length as usize;
        if body.len() < len {
            return Err(ConfigRomError::Truncated);
        }
        let body = &body[..len];
        Ok(Self {
            base,
            entries: body.iter().map(|q| DirectoryEntry::decode(*q)).collect(),
            crc_ok: crc16(body) == header.crc,
        })
    }

    /// エントリ `index` のアドレス
    pub fn entry_address(&self, index: usize) -> u64 {
        self.base + 4 + (index as u64) * 4
    }

    /// キーに一致する最初の即値
    pub fn immediate(&self, key: u8) -> Option<u32> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.value)
    }

    /// キーに一致するすべてのエントリの (アドレス, エントリ)
    pub fn find_all(&self, key: u8) -> impl Iterator<Item = (u64, DirectoryEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.key == key)
            .map(|(i, e)| (self.entry_address(i), *e))
    }
}

/// エントリ列をヘッダ付きのクワッドレット列にエンコード
pub fn encode_directory(entries: &[DirectoryEntry]) -> Vec<u32> {
    let body: Vec<u32> = entries.iter().map(|e| e.encode()).collect();
    let header = DirectoryHeader { length: body.len() as u16, crc: crc16(&body) };
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(header.encode());
    out.extend(body);
    out
}

// ============================================================================
// Bus Info Block
// ============================================================================

/// バス情報ブロック
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusInfoBlock {
    /// max_rec（最大受信ペイロード = 2^(max_rec+1)）
    pub max_rec: u8,
    /// リンク速度
    pub link_speed: BusSpeed,
    /// ROM世代
    pub generation: u8,
    /// EUI-64 固有識別子
    pub guid: u64,
}

impl BusInfoBlock {
    /// 先頭5クワッドレット（ホストオーダー）から解析
    pub fn parse(quadlets: &[u32]) -> Result<Self, ConfigRomError> {
        if quadlets.len() < defs::BUS_INFO_QUADLETS as usize {
            return Err(ConfigRomError::Truncated);
        }
        if quadlets[1] != defs::BUS_INFO_SIGNATURE {
            return Err(ConfigRomError::BadSignature);
        }
        let flags = quadlets[2];
        Ok(Self {
            max_rec: ((flags >> 12) & 0xF) as u8,
            link_speed: BusSpeed::from_code((flags & 0x7) as u8),
            generation: ((flags >> 4) & 0xF) as u8,
            guid: ((quadlets[3] as u64) << 32) | quadlets[4] as u64,
        })
    }

    /// デバイスが受け付けるmax_payload（ORBエンコーディング）
    ///
    /// max_rec のバイト数は 2^(max_rec+1)、ORB は 2^(code+2)。
    pub fn max_payload_code(&self) -> u8 {
        self.max_rec.saturating_sub(1)
    }
}

// ============================================================================
// Unit Directory
// ============================================================================

/// 論理ユニット（0x14 エントリ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalUnit {
    pub lun: u16,
    /// デバイス種別（INQUIRYのperipheral device type）
    pub device_type: u8,
    /// 順序付き実行（ordered bit）
    pub ordered: bool,
}

impl LogicalUnit {
    pub fn from_value(value: u32) -> Self {
        Self {
            lun: (value & 0xFFFF) as u16,
            device_type: ((value >> 16) & 0x1F) as u8,
            ordered: value & (1 << 22) != 0,
        }
    }
}

/// ユニット特性（0x3A エントリ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitCharacteristics {
    /// 管理ORBのタイムアウト（500ms単位）
    pub mgmt_orb_timeout: u8,
    /// ORBサイズ（クワッドレット）
    pub orb_size: u8,
}

impl UnitCharacteristics {
    pub fn from_value(value: u32) -> Self {
        Self { mgmt_orb_timeout: ((value >> 8) & 0xFF) as u8, orb_size: (value & 0xFF) as u8 }
    }

    pub fn mgmt_timeout_ms(&self) -> u64 {
        self.mgmt_orb_timeout as u64 * defs::MGMT_TIMEOUT_UNIT_MS
    }
}

/// SBP-2 ユニットディレクトリの解釈結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    /// 管理エージェントのCSRアドレス
    pub management_agent: u64,
    pub command_set_spec_id: u32,
    pub command_set: u32,
    pub characteristics: UnitCharacteristics,
    pub firmware_revision: u32,
    pub model_id: u32,
    pub logical_units: Vec<LogicalUnit>,
}

impl UnitInfo {
    /// ユニットディレクトリがストレージプロトコルのものか
    pub fn is_sbp2(dir: &Directory) -> bool {
        dir.immediate(key::UNIT_SPEC_ID) == Some(defs::SBP2_UNIT_SPEC_ID)
            && dir.immediate(key::UNIT_SW_VERSION) == Some(defs::SBP2_SW_VERSION)
    }

    /// ユニットディレクトリを解釈する
    ///
    /// `model_fallback` はルートディレクトリのモデルID。
    /// 論理ユニットディレクトリ (0xD4) 内の 0x14 は呼び出し側が `extra_luns` で渡す。
    pub fn from_directory(dir: &Directory, model_fallback: u32, extra_luns: &[LogicalUnit]) -> Result<Self, ConfigRomError> {
        let (mgmt_addr, mgmt) = dir
            .find_all(key::MANAGEMENT_AGENT)
            .next()
            .ok_or(ConfigRomError::MissingKey(key::MANAGEMENT_AGENT))?;
        let management_agent = mgmt.target_address(mgmt_addr).ok_or(ConfigRomError::BadOffset)?;

        let mut logical_units: Vec<LogicalUnit> = dir
            .find_all(key::LOGICAL_UNIT_NUMBER)
            .map(|(_, e)| LogicalUnit::from_value(e.value))
            .collect();
        logical_units.extend_from_slice(extra_luns);
        if logical_units.is_empty() {
            // LUN 0 が暗黙の既定
            logical_units.push(LogicalUnit { lun: 0, device_type: defs::DEVICE_TYPE_DISK, ordered: false });
        }

        Ok(Self {
            management_agent,
            command_set_spec_id: dir.immediate(key::COMMAND_SET_SPEC_ID).unwrap_or(0),
            command_set: dir.immediate(key::COMMAND_SET).unwrap_or(0),
            characteristics: dir
                .immediate(key::UNIT_CHARACTERISTICS)
                .map(UnitCharacteristics::from_value)
                .unwrap_or_default(),
            firmware_revision: dir.immediate(key::FIRMWARE_REVISION).unwrap_or(0),
            model_id: dir.immediate(key::MODEL_ID).unwrap_or(model_fallback),
            logical_units,
        })
    }
}
