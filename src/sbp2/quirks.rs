// ============================================================================
// src/sbp2/quirks.rs - Device Workarounds
// ============================================================================
//!
//! 不具合のあるブリッジチップ向けの回避策。
//!
//! ファームウェアリビジョン（下位8ビットを無視）とモデルIDで照合する。
//! `DriverConfig::workaround_overrides` が設定されていれば表より優先。

use bitflags::bitflags;

bitflags! {
    /// 回避策フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u32 {
        /// 1コマンドの転送ブロック数を制限し、超過分を分割する
        const MAX_TRANSFER_LIMITED = 1 << 0;
        /// INQUIRY の割り当て長を36バイトに抑える
        const INQUIRY_36 = 1 << 1;
        /// MODE SENSE を送らず合成応答で成功させる
        const SYNTHESIZE_MODE_SENSE = 1 << 2;
        /// 容量が1ブロック多く報告される（上位層への通知のみ）
        const FIX_CAPACITY = 1 << 3;
    }
}

/// モデルIDのワイルドカード
pub const MODEL_WILDCARD: u32 = 0xFFFF_FFFF;

/// ファームウェアリビジョンの比較マスク
const FIRMWARE_MASK: u32 = 0x00FF_FF00;

struct QuirkEntry {
    firmware_revision: u32,
    model_id: u32,
    quirks: Quirks,
}

static QUIRK_TABLE: &[QuirkEntry] = &[
    // DViCO Momobay CX-1 / 各種 Initio ブリッジ
    QuirkEntry {
        firmware_revision: 0x002800,
        model_id: 0x001010,
        quirks: Quirks::INQUIRY_36.union(Quirks::SYNTHESIZE_MODE_SENSE),
    },
    // Initio ブリッジ（汎用）
    QuirkEntry { firmware_revision: 0x000200, model_id: MODEL_WILDCARD, quirks: Quirks::INQUIRY_36 },
    // Symbios ブリッジ
    QuirkEntry { firmware_revision: 0xA0B800, model_id: MODEL_WILDCARD, quirks: Quirks::MAX_TRANSFER_LIMITED },
    // Datafab MD2-FW2
    QuirkEntry { firmware_revision: 0x002600, model_id: MODEL_WILDCARD, quirks: Quirks::MAX_TRANSFER_LIMITED },
    // iPod 各種
    QuirkEntry { firmware_revision: 0x0A2700, model_id: 0x000021, quirks: Quirks::FIX_CAPACITY },
    QuirkEntry { firmware_revision: 0x0A2700, model_id: 0x000023, quirks: Quirks::FIX_CAPACITY },
    QuirkEntry { firmware_revision: 0x0A2700, model_id: 0x00007E, quirks: Quirks::FIX_CAPACITY },
];

impl Quirks {
    /// 表から回避策を引く
    pub fn lookup(firmware_revision: u32, model_id: u32) -> Quirks {
        let mut quirks = Quirks::empty();
        for entry in QUIRK_TABLE {
            if entry.firmware_revision != firmware_revision & FIRMWARE_MASK {
                continue;
            }
            if entry.model_id != MODEL_WILDCARD && entry.model_id != model_id {
                continue;
            }
            quirks |= entry.quirks;
        }
        quirks
    }

    /// 上書き設定があればそれを、なければ表の値を使う
    pub fn resolve(firmware_revision: u32, model_id: u32, overrides: Option<Quirks>) -> Quirks {
        overrides.unwrap_or_else(|| Self::lookup(firmware_revision, model_id))
    }
}
