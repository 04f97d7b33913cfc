// ============================================================================
// src/sbp2/orb.rs - Operation Request Blocks
// ============================================================================
//!
//! # ORB (Operation Request Block)
//!
//! コマンドORB・管理ORB・ログイン応答・ページテーブルのワイヤ形式。
//! 構造体はホストオーダーのクワッドレットで組み立て、
//! 境界で一度だけビッグエンディアンに変換する。
//!
//! ## コマンドORB (32バイト)
//! ```text
//! +0  next_ORB  [null:1 | node_id:15 .. | addr_hi:16] [addr_lo:32]
//! +8  data_desc [node_id:16 | addr_hi:16]              [addr_lo:32]
//! +16 misc      notify|rq_fmt|dir|spd|max_payload|page_table|page_size|data_size
//! +20 CDB       12バイト
//! ```

use alloc::vec::Vec;

use super::defs;
use crate::bus::{BusSpeed, NodeId};
use crate::dma::SgSegment;
use crate::error::DmaError;

// ============================================================================
// Byte Order Boundary
// ============================================================================

/// ホストオーダーのクワッドレット列をワイヤ形式（ビッグエンディアン）へ
pub fn quadlets_to_wire(quadlets: &[u32], out: &mut [u8]) {
    for (q, chunk) in quadlets.iter().zip(out.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&q.to_be_bytes());
    }
}

/// ワイヤ形式からホストオーダーのクワッドレット列へ
pub fn wire_to_quadlets(bytes: &[u8], out: &mut [u32]) {
    for (q, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *q = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

/// ノードIDと48ビットアドレスから上位クワッドレットを作る
#[inline]
fn addr_hi(node: NodeId, address: u64) -> u32 {
    ((node.as_u16() as u32) << 16) | ((address >> 32) as u32 & 0xFFFF)
}

#[inline]
fn addr_from(hi: u32, lo: u32) -> u64 {
    (((hi & 0xFFFF) as u64) << 32) | lo as u64
}

// ============================================================================
// ORB Pointer
// ============================================================================

/// ORBポインタ（null ビット付き）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrbPointer {
    /// 次のORBなし
    Null,
    /// ノード上のアドレス
    Address { node: NodeId, address: u64 },
}

impl OrbPointer {
    const NULL_BIT: u32 = 0x8000_0000;

    pub fn encode(&self) -> [u32; 2] {
        match *self {
            OrbPointer::Null => [Self::NULL_BIT, 0],
            OrbPointer::Address { node, address } => [addr_hi(node, address), address as u32],
        }
    }

    pub fn decode(hi: u32, lo: u32) -> Self {
        if hi & Self::NULL_BIT != 0 {
            OrbPointer::Null
        } else {
            OrbPointer::Address { node: NodeId((hi >> 16) as u16), address: addr_from(hi, lo) }
        }
    }

    /// ORB_POINTER レジスタへ書く8バイト
    pub fn to_wire(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        quadlets_to_wire(&self.encode(), &mut out);
        out
    }
}

// ============================================================================
// Command ORB
// ============================================================================

/// max_payload のバイト数からORBエンコーディングへ（log2(bytes) - 2）
pub fn max_payload_code(bytes: u32) -> u8 {
    if bytes < 4 {
        return 0;
    }
    (31 - bytes.leading_zeros()).saturating_sub(2).min(0xF) as u8
}

/// ORBエンコーディングからバイト数へ
pub fn max_payload_bytes(code: u8) -> u32 {
    1u32 << (code.min(0xF) as u32 + 2)
}

/// コマンドORBの misc フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMisc {
    /// 完了時に必ずステータスを書かせる
    pub notify: bool,
    /// true ならデバイスからホストへの転送（READ）
    pub from_device: bool,
    pub speed: BusSpeed,
    /// max_payload（ORBエンコーディング）
    pub max_payload: u8,
    pub page_table_present: bool,
    pub page_size: u8,
    /// バイト数、ページテーブル時はエントリ数
    pub data_size: u16,
}

impl CommandMisc {
    pub fn encode(&self) -> u32 {
        ((self.notify as u32) << 31)
            | ((self.from_device as u32) << 27)
            | ((self.speed.code() as u32 & 0x7) << 24)
            | ((self.max_payload as u32 & 0xF) << 20)
            | ((self.page_table_present as u32) << 19)
            | ((self.page_size as u32 & 0x7) << 16)
            | self.data_size as u32
    }

    pub fn decode(q: u32) -> Self {
        Self {
            notify: q & (1 << 31) != 0,
            from_device: q & (1 << 27) != 0,
            speed: BusSpeed::from_code(((q >> 24) & 0x7) as u8),
            max_payload: ((q >> 20) & 0xF) as u8,
            page_table_present: q & (1 << 19) != 0,
            page_size: ((q >> 16) & 0x7) as u8,
            data_size: q as u16,
        }
    }
}

/// コマンドORB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOrb {
    pub next: OrbPointer,
    /// データ記述子（データバッファまたはページテーブルのアドレス）
    pub data_descriptor: OrbPointer,
    pub misc: CommandMisc,
    pub cdb: [u8; defs::CDB_AREA_SIZE],
}

impl CommandOrb {
    /// 次ORBのアドレスフィールドのバイトオフセット
    pub const NEXT_ORB_OFFSET: usize = 0;

    pub fn encode(&self) -> [u32; 8] {
        let next = self.next.encode();
        let data = match self.data_descriptor {
            OrbPointer::Null => [0, 0],
            ptr => ptr.encode(),
        };
        let mut cdb = [0u32; 3];
        wire_to_quadlets(&self.cdb, &mut cdb);
        [next[0], next[1], data[0], data[1], self.misc.encode(), cdb[0], cdb[1], cdb[2]]
    }

    pub fn decode(q: &[u32; 8]) -> Self {
        let mut cdb = [0u8; defs::CDB_AREA_SIZE];
        quadlets_to_wire(&q[5..8], &mut cdb);
        let misc = CommandMisc::decode(q[4]);
        let data_descriptor = if misc.data_size == 0 {
            OrbPointer::Null
        } else {
            OrbPointer::decode(q[2], q[3])
        };
        Self { next: OrbPointer::decode(q[0], q[1]), data_descriptor, misc, cdb }
    }

    pub fn to_wire(&self) -> [u8; defs::COMMAND_ORB_SIZE] {
        let mut out = [0u8; defs::COMMAND_ORB_SIZE];
        quadlets_to_wire(&self.encode(), &mut out);
        out
    }

    pub fn from_wire(bytes: &[u8; defs::COMMAND_ORB_SIZE]) -> Self {
        let mut q = [0u32; 8];
        wire_to_quadlets(bytes, &mut q);
        Self::decode(&q)
    }
}

// ============================================================================
// Page Table
// ============================================================================

/// ページテーブルエントリ（非正規化形式）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub segment_len: u16,
    /// 48ビットのバスアドレス
    pub base: u64,
}

impl PageTableEntry {
    pub fn encode(&self) -> [u32; 2] {
        [((self.segment_len as u32) << 16) | ((self.base >> 32) as u32 & 0xFFFF), self.base as u32]
    }

    pub fn decode(hi: u32, lo: u32) -> Self {
        Self { segment_len: (hi >> 16) as u16, base: addr_from(hi, lo) }
    }
}

/// スキャッタ/ギャザー区間からページテーブルを作る
///
/// 1要素は `MAX_PAGE_TABLE_ELEMENT_LEN` まで。長い区間は複数要素に分ける。
pub fn build_page_table(segments: &[SgSegment]) -> Result<Vec<PageTableEntry>, DmaError> {
    let mut table = Vec::new();
    for seg in segments {
        let mut addr = seg.addr;
        let mut remaining = seg.len;
        while remaining > 0 {
            let len = remaining.min(defs::MAX_PAGE_TABLE_ELEMENT_LEN);
            if table.len() >= defs::PAGE_TABLE_ENTRIES {
                return Err(DmaError::TooManySegments);
            }
            table.push(PageTableEntry { segment_len: len as u16, base: addr });
            addr += len as u64;
            remaining -= len;
        }
    }
    Ok(table)
}

/// ページテーブルをワイヤ形式へ
pub fn page_table_to_wire(table: &[PageTableEntry]) -> Vec<u8> {
    let mut out = alloc::vec![0u8; table.len() * defs::PAGE_TABLE_ENTRY_SIZE];
    for (entry, chunk) in table.iter().zip(out.chunks_exact_mut(defs::PAGE_TABLE_ENTRY_SIZE)) {
        quadlets_to_wire(&entry.encode(), chunk);
    }
    out
}

// ============================================================================
// Management ORBs
// ============================================================================

/// 管理ORBの機能コード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagementFunction {
    Login = 0x0,
    QueryLogins = 0x1,
    Reconnect = 0x3,
    Logout = 0x7,
}

const MGMT_NOTIFY: u32 = 1 << 31;
const MGMT_EXCLUSIVE: u32 = 1 << 28;

/// ログインORB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginOrb {
    /// ホストのノードID（応答・ステータスの宛先）
    pub host_node: NodeId,
    pub login_response: u64,
    pub login_response_len: u16,
    pub lun: u16,
    pub exclusive: bool,
    /// 再接続の猶予（2^n 秒）
    pub reconnect_hold: u8,
    pub status_fifo: u64,
}

impl LoginOrb {
    pub fn encode(&self) -> [u32; 8] {
        let lun_misc = MGMT_NOTIFY
            | if self.exclusive { MGMT_EXCLUSIVE } else { 0 }
            | ((self.reconnect_hold as u32 & 0xF) << 20)
            | ((ManagementFunction::Login as u32) << 16)
            | self.lun as u32;
        [
            0,
            0,
            addr_hi(self.host_node, self.login_response),
            self.login_response as u32,
            lun_misc,
            self.login_response_len as u32,
            addr_hi(self.host_node, self.status_fifo),
            self.status_fifo as u32,
        ]
    }

    pub fn to_wire(&self) -> [u8; defs::MANAGEMENT_ORB_SIZE] {
        let mut out = [0u8; defs::MANAGEMENT_ORB_SIZE];
        quadlets_to_wire(&self.encode(), &mut out);
        out
    }
}

/// 再接続/ログアウトORB（ログインIDだけを運ぶ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginIdOrb {
    pub function: ManagementFunction,
    pub host_node: NodeId,
    pub login_id: u16,
    pub status_fifo: u64,
}

impl LoginIdOrb {
    pub fn reconnect(host_node: NodeId, login_id: u16, status_fifo: u64) -> Self {
        Self { function: ManagementFunction::Reconnect, host_node, login_id, status_fifo }
    }

    pub fn logout(host_node: NodeId, login_id: u16, status_fifo: u64) -> Self {
        Self { function: ManagementFunction::Logout, host_node, login_id, status_fifo }
    }

    pub fn encode(&self) -> [u32; 8] {
        let misc = MGMT_NOTIFY | ((self.function as u32) << 16) | self.login_id as u32;
        [
            0,
            0,
            0,
            0,
            misc,
            0,
            addr_hi(self.host_node, self.status_fifo),
            self.status_fifo as u32,
        ]
    }

    pub fn to_wire(&self) -> [u8; defs::MANAGEMENT_ORB_SIZE] {
        let mut out = [0u8; defs::MANAGEMENT_ORB_SIZE];
        quadlets_to_wire(&self.encode(), &mut out);
        out
    }
}

/// 管理ORBの lun_misc から (機能, LUNまたはログインID) を取り出す
pub fn decode_management_misc(q: u32) -> (u8, u16) {
    (((q >> 16) & 0xF) as u8, q as u16)
}

// ============================================================================
// Login Response
// ============================================================================

/// ログイン応答（16バイト）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginResponse {
    pub length: u16,
    pub login_id: u16,
    /// コマンドブロックエージェントのCSRベース
    pub command_agent: u64,
    pub reconnect_hold: u16,
}

impl LoginResponse {
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < defs::LOGIN_RESPONSE_SIZE {
            return None;
        }
        let mut q = [0u32; 4];
        wire_to_quadlets(&bytes[..defs::LOGIN_RESPONSE_SIZE], &mut q);
        Some(Self {
            length: (q[0] >> 16) as u16,
            login_id: q[0] as u16,
            command_agent: addr_from(q[1], q[2]),
            reconnect_hold: q[3] as u16,
        })
    }

    pub fn to_wire(&self) -> [u8; defs::LOGIN_RESPONSE_SIZE] {
        let q = [
            ((self.length as u32) << 16) | self.login_id as u32,
            (self.command_agent >> 32) as u32 & 0xFFFF,
            self.command_agent as u32,
            self.reconnect_hold as u32,
        ];
        let mut out = [0u8; defs::LOGIN_RESPONSE_SIZE];
        quadlets_to_wire(&q, &mut out);
        out
    }
}
