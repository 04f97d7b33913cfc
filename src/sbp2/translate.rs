// ============================================================================
// src/sbp2/translate.rs - SCSI Command Translation
// ============================================================================
//!
//! # コマンド変換
//!
//! 汎用層のSCSIコマンドをコマンドORBのフラグメント列へ変換する。
//!
//! - バッファ形状で no-data / 直接 / ページテーブル を選ぶ
//! - RBCデバイス向けに 6バイトの READ/WRITE/MODE SENSE を10バイト形式へ
//! - `MAX_TRANSFER_LIMITED` のデバイスでは転送をブロック数で分割
//! - `INQUIRY_36` / `SYNTHESIZE_MODE_SENSE` の回避策

use alloc::vec::Vec;

use super::defs;
use super::orb::{CommandMisc, CommandOrb, OrbPointer, PageTableEntry, build_page_table};
use super::quirks::Quirks;
use crate::bus::{BusSpeed, NodeId};
use crate::dma::{DataDirection, DmaPlatform, MappedBuffer, SgSegment, slice_segments};
use crate::error::{DmaError, GeneralError, Sbp2Error};
use crate::scsi::{Cdb, ScsiCommand, opcode};

/// INQUIRY の割り当て長上限（回避策）
pub const INQUIRY_36_LEN: u8 = 36;

// ============================================================================
// CDB Rewrites
// ============================================================================

/// RBC デバイス向けに 6バイトCDBを10バイト形式へ書き換える
pub fn rewrite_for_rbc(cdb: &Cdb) -> Option<Cdb> {
    let b = cdb.as_bytes();
    if b.len() < 6 {
        return None;
    }
    match cdb.opcode() {
        opcode::READ_6 | opcode::WRITE_6 => {
            let (lba, count) = cdb.block_range()?;
            let op = if cdb.opcode() == opcode::READ_6 { opcode::READ_10 } else { opcode::WRITE_10 };
            let mut out = [0u8; 10];
            out[0] = op;
            out[2..6].copy_from_slice(&(lba as u32).to_be_bytes());
            out[7..9].copy_from_slice(&(count as u16).to_be_bytes());
            out[9] = b[5];
            Some(Cdb::from_slice(&out))
        }
        opcode::MODE_SENSE_6 => {
            let mut out = [0u8; 10];
            out[0] = opcode::MODE_SENSE_10;
            out[1] = b[1];
            out[2] = b[2];
            out[3] = b[3];
            // 10バイト形式のヘッダは4バイト長い
            out[7..9].copy_from_slice(&(b[4] as u16 + 4).to_be_bytes());
            out[9] = b[5];
            Some(Cdb::from_slice(&out))
        }
        _ => None,
    }
}

/// 完了後の応答書き換え
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFixup {
    /// MODE SENSE(10) の応答を MODE SENSE(6) の形式へ戻す
    ModeSense10To6,
}

impl ResponseFixup {
    /// マッピング済みバッファ上の応答を書き換える
    pub fn apply(&self, dma: &dyn DmaPlatform, mapping: &MappedBuffer) {
        match self {
            ResponseFixup::ModeSense10To6 => {
                let mut buf = alloc::vec![0u8; mapping.total_len() as usize];
                let n = dma.copy_from_mapped(mapping, &mut buf);
                if n < 8 {
                    return;
                }
                let converted = mode_sense_10_to_6(&buf[..n]);
                dma.copy_to_mapped(mapping, &converted);
            }
        }
    }
}

/// MODE SENSE(10) パラメータヘッダを (6) 形式へ変換する
pub fn mode_sense_10_to_6(data: &[u8]) -> Vec<u8> {
    let len10 = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut out = Vec::with_capacity(data.len());
    out.push(len10.saturating_sub(3).min(0xFF) as u8);
    out.push(data[2]);
    out.push(data[3]);
    out.push(data[7]);
    out.extend_from_slice(&data[8..]);
    out
}

/// 合成する MODE SENSE 応答（ブロック記述子・ページなし）
pub fn synthesized_mode_sense(cdb: &Cdb) -> Vec<u8> {
    if cdb.opcode() == opcode::MODE_SENSE_10 {
        alloc::vec![0, 6, 0, 0, 0, 0, 0, 0]
    } else {
        alloc::vec![3, 0, 0, 0]
    }
}

// ============================================================================
// Fragments
// ============================================================================

/// フラグメントのデータ記述
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataShape {
    /// データフェーズなし
    None,
    /// 単一バッファを直接指す
    Direct(SgSegment),
    /// ページテーブル経由
    PageTable(Vec<PageTableEntry>),
}

/// 1つのコマンドORBになる単位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub cdb: [u8; defs::CDB_AREA_SIZE],
    pub data: DataShape,
    /// 分割時のブロック数（分割しない場合は None）
    pub blocks: Option<u32>,
}

/// 変換結果
pub enum Translation {
    /// ORBを発行せずに成功した（合成応答）
    Synthesized,
    /// 発行するフラグメント
    Orbs {
        fragments: Vec<Fragment>,
        mapping: Option<MappedBuffer>,
        from_device: bool,
        fixup: Option<ResponseFixup>,
    },
}

/// 変換に使うセッションの属性
#[derive(Debug, Clone, Copy)]
pub struct TranslateParams {
    pub quirks: Quirks,
    pub rbc: bool,
    pub limited_max_blocks: u32,
    /// 1コマンドに使える記述子の上限（セッションのプール容量）
    pub max_fragments: usize,
}

/// ORBの組み立てに使う交渉済みの値
#[derive(Debug, Clone, Copy)]
pub struct OrbParams {
    pub host: NodeId,
    pub speed: BusSpeed,
    pub max_payload: u8,
}

fn shape_for(segments: &[SgSegment]) -> Result<DataShape, DmaError> {
    let total: u64 = segments.iter().map(|s| s.len as u64).sum();
    match segments {
        [] => Ok(DataShape::None),
        _ if total == 0 => Ok(DataShape::None),
        [single] if single.len <= defs::MAX_DATA_SIZE => Ok(DataShape::Direct(*single)),
        _ => Ok(DataShape::PageTable(build_page_table(segments)?)),
    }
}

fn cdb_area(cdb: &Cdb) -> [u8; defs::CDB_AREA_SIZE] {
    let mut area = [0u8; defs::CDB_AREA_SIZE];
    area[..cdb.len()].copy_from_slice(cdb.as_bytes());
    area
}

/// SCSIコマンドをフラグメント列へ変換する
///
/// データバッファはここでマッピングする。エラー時はマッピングを残さない。
pub fn translate(
    command: &ScsiCommand,
    params: &TranslateParams,
    dma: &dyn DmaPlatform,
) -> Result<Translation, Sbp2Error> {
    let mut cdb = command.cdb;
    if cdb.len() > defs::CDB_AREA_SIZE || cdb.is_empty() {
        return Err(GeneralError::NotSupported.into());
    }

    let is_mode_sense = matches!(cdb.opcode(), opcode::MODE_SENSE_6 | opcode::MODE_SENSE_10);
    if is_mode_sense && params.quirks.contains(Quirks::SYNTHESIZE_MODE_SENSE) {
        if command.data.has_data() {
            let mapping = dma.map(&command.data.segments, DataDirection::FromDevice)?;
            let response = synthesized_mode_sense(&cdb);
            let b = cdb.as_bytes();
            let alloc_len = match cdb.opcode() {
                opcode::MODE_SENSE_10 => b.get(7..9).map_or(0, |l| u16::from_be_bytes([l[0], l[1]]) as usize),
                _ => b.get(4).map_or(0, |&l| l as usize),
            };
            dma.copy_to_mapped(&mapping, &response[..response.len().min(alloc_len)]);
            dma.unmap(mapping);
        }
        return Ok(Translation::Synthesized);
    }

    let mut fixup = None;
    if params.rbc {
        if let Some(rewritten) = rewrite_for_rbc(&cdb) {
            if cdb.opcode() == opcode::MODE_SENSE_6 {
                fixup = Some(ResponseFixup::ModeSense10To6);
            }
            cdb = rewritten;
        }
    }

    let mut data_len = command.data.total_len();
    if cdb.opcode() == opcode::INQUIRY && cdb.len() >= 6 && params.quirks.contains(Quirks::INQUIRY_36) {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&cdb.as_bytes()[..6]);
        let alloc_len = u16::from_be_bytes([bytes[3], bytes[4]]).min(INQUIRY_36_LEN as u16);
        bytes[3] = 0;
        bytes[4] = alloc_len as u8;
        cdb = Cdb::from_slice(&bytes);
        data_len = data_len.min(INQUIRY_36_LEN as u64);
    }

    if !command.data.has_data() {
        return Ok(Translation::Orbs {
            fragments: alloc::vec![Fragment { cdb: cdb_area(&cdb), data: DataShape::None, blocks: None }],
            mapping: None,
            from_device: false,
            fixup: None,
        });
    }

    let from_device = command.data.direction == DataDirection::FromDevice;
    let mapping = dma.map(&command.data.segments, command.data.direction)?;

    match build_fragments(&cdb, &mapping, data_len, params) {
        Ok(fragments) => Ok(Translation::Orbs { fragments, mapping: Some(mapping), from_device, fixup }),
        Err(e) => {
            dma.unmap(mapping);
            Err(e)
        }
    }
}

fn build_fragments(
    cdb: &Cdb,
    mapping: &MappedBuffer,
    data_len: u64,
    params: &TranslateParams,
) -> Result<Vec<Fragment>, Sbp2Error> {
    let limit = params.limited_max_blocks.max(1);
    let split = match cdb.block_range() {
        Some((lba, count)) if params.quirks.contains(Quirks::MAX_TRANSFER_LIMITED) && count > limit => {
            // ブロック長が決まらないまま上限超えの転送を送ることはしない
            if data_len % count as u64 != 0 {
                log::warn!("[SBP2] {} bytes do not divide into {} blocks", data_len, count);
                return Err(GeneralError::InvalidArgument.into());
            }
            if count.div_ceil(limit) as usize > params.max_fragments {
                log::warn!(
                    "[SBP2] {} blocks need {} descriptors, pool holds {}",
                    count,
                    count.div_ceil(limit),
                    params.max_fragments
                );
                return Err(GeneralError::TransferTooLarge.into());
            }
            Some((lba, count, data_len / count as u64))
        }
        _ => None,
    };

    let Some((lba, count, block_size)) = split else {
        let slices = slice_segments(&mapping.segments, 0, data_len);
        return Ok(alloc::vec![Fragment { cdb: cdb_area(cdb), data: shape_for(&slices)?, blocks: None }]);
    };

    log::debug!("[SBP2] splitting {} blocks at LBA {:#x} into chunks of {}", count, lba, limit);
    let mut fragments = Vec::with_capacity(count.div_ceil(limit) as usize);
    let mut done = 0u32;
    while done < count {
        let blocks = (count - done).min(limit);
        let piece = cdb.with_block_range(lba + done as u64, blocks);
        let slices = slice_segments(&mapping.segments, done as u64 * block_size, blocks as u64 * block_size);
        fragments.push(Fragment { cdb: cdb_area(&piece), data: shape_for(&slices)?, blocks: Some(blocks) });
        done += blocks;
    }
    Ok(fragments)
}

/// フラグメントからコマンドORBを組み立てる
///
/// `page_table_addr` は記述子に付属するページテーブルのバスアドレス。
pub fn build_orb(fragment: &Fragment, from_device: bool, params: &OrbParams, page_table_addr: u64) -> CommandOrb {
    let (data_descriptor, page_table_present, data_size, has_data) = match &fragment.data {
        DataShape::None => (OrbPointer::Null, false, 0u16, false),
        DataShape::Direct(seg) => (
            OrbPointer::Address { node: params.host, address: seg.addr },
            false,
            seg.len as u16,
            true,
        ),
        DataShape::PageTable(table) => (
            OrbPointer::Address { node: params.host, address: page_table_addr },
            true,
            table.len() as u16,
            true,
        ),
    };
    CommandOrb {
        next: OrbPointer::Null,
        data_descriptor,
        misc: CommandMisc {
            notify: true,
            from_device: has_data && from_device,
            speed: params.speed,
            max_payload: params.max_payload,
            page_table_present,
            page_size: 0,
            data_size,
        },
        cdb: fragment.cdb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::{CommandId, DataBuffer};
    use crate::sbp2::session::SessionHandle;
    use crate::testing::MockDma;
    use alloc::vec;

    const HANDLE: SessionHandle = SessionHandle { slot: 0, generation: 0 };

    fn params(quirks: Quirks, rbc: bool) -> TranslateParams {
        TranslateParams { quirks, rbc, limited_max_blocks: 128, max_fragments: 16 }
    }

    fn read10(lba: u32, count: u16) -> [u8; 10] {
        let mut c = [0u8; 10];
        c[0] = opcode::READ_10;
        c[2..6].copy_from_slice(&lba.to_be_bytes());
        c[7..9].copy_from_slice(&count.to_be_bytes());
        c
    }

    #[test]
    fn test_rbc_read6_rewrite() {
        let cdb = Cdb::from_slice(&[opcode::READ_6, 0x01, 0x02, 0x03, 0, 0]);
        let out = rewrite_for_rbc(&cdb).unwrap();
        assert_eq!(out.opcode(), opcode::READ_10);
        assert_eq!(out.block_range(), Some((0x010203, 256)));
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_rbc_mode_sense_rewrite() {
        let cdb = Cdb::from_slice(&[opcode::MODE_SENSE_6, 0x08, 0x3F, 0, 0xC0, 0]);
        let out = rewrite_for_rbc(&cdb).unwrap();
        assert_eq!(out.as_bytes(), &[opcode::MODE_SENSE_10, 0x08, 0x3F, 0, 0, 0, 0, 0, 0xC4, 0]);
        assert!(rewrite_for_rbc(&Cdb::from_slice(&[opcode::INQUIRY, 0, 0, 0, 36, 0])).is_none());
    }

    #[test]
    fn test_mode_sense_response_conversion() {
        let data = [0, 10, 0x00, 0x80, 0, 0, 0, 0, 0x08, 0x0A, 0xAA, 0xBB];
        let out = mode_sense_10_to_6(&data);
        assert_eq!(out, vec![7, 0x00, 0x80, 0, 0x08, 0x0A, 0xAA, 0xBB]);
    }

    #[test]
    fn test_no_data_command() {
        let dma = MockDma::new();
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &[opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0], DataBuffer::none());
        match translate(&cmd, &params(Quirks::empty(), false), &dma).ok().unwrap() {
            Translation::Orbs { fragments, mapping, .. } => {
                assert_eq!(fragments.len(), 1);
                assert_eq!(fragments[0].data, DataShape::None);
                assert!(mapping.is_none());
            }
            Translation::Synthesized => panic!("unexpected synthesized"),
        }
    }

    #[test]
    fn test_split_300_blocks() {
        let dma = MockDma::new();
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x10_0000, 300 * 512)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &read10(0x1000, 300), data);
        let t = translate(&cmd, &params(Quirks::MAX_TRANSFER_LIMITED, false), &dma).ok().unwrap();
        let Translation::Orbs { fragments, mapping, from_device, .. } = t else { panic!("expected orbs") };
        assert!(from_device);
        assert_eq!(fragments.len(), 3);
        let blocks: Vec<u32> = fragments.iter().map(|f| f.blocks.unwrap()).collect();
        assert_eq!(blocks, vec![128, 128, 44]);
        assert_eq!(blocks.iter().sum::<u32>(), 300);

        let third = Cdb::from_slice(&fragments[2].cdb[..10]);
        assert_eq!(third.block_range(), Some((0x1000 + 256, 44)));
        let mapping = mapping.unwrap();
        let base = mapping.segments[0].addr;
        match &fragments[1].data {
            DataShape::PageTable(t) => {
                assert_eq!(t[0].base, base + 128 * 512);
                let total: u32 = t.iter().map(|e| e.segment_len as u32).sum();
                assert_eq!(total, 128 * 512);
            }
            other => panic!("unexpected shape {:?}", other),
        }
        dma.unmap(mapping);
    }

    #[test]
    fn test_split_beyond_pool_is_refused() {
        let dma = MockDma::new();
        // 3000 / 128 -> 24 フラグメント > 16
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x10_0000, 3000 * 512)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &read10(0, 3000), data);
        let err = translate(&cmd, &params(Quirks::MAX_TRANSFER_LIMITED, false), &dma).err().unwrap();
        assert_eq!(err, Sbp2Error::General(GeneralError::TransferTooLarge));
        assert_eq!(dma.live_mappings(), 0);

        // ちょうど16フラグメントなら通る
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x10_0000, 2048 * 512)]);
        let cmd = ScsiCommand::new(CommandId(2), HANDLE, &read10(0, 2048), data);
        let Translation::Orbs { fragments, mapping, .. } =
            translate(&cmd, &params(Quirks::MAX_TRANSFER_LIMITED, false), &dma).ok().unwrap()
        else {
            panic!("expected orbs")
        };
        assert_eq!(fragments.len(), 16);
        dma.unmap(mapping.unwrap());
    }

    #[test]
    fn test_split_with_uneven_buffer_is_refused() {
        let dma = MockDma::new();
        // 300ブロックに対して 300*512+100 バイト
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x10_0000, 300 * 512 + 100)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &read10(0, 300), data);
        let err = translate(&cmd, &params(Quirks::MAX_TRANSFER_LIMITED, false), &dma).err().unwrap();
        assert_eq!(err, Sbp2Error::General(GeneralError::InvalidArgument));
        assert_eq!(dma.live_mappings(), 0);
    }

    #[test]
    fn test_sixteen_byte_cdb_is_refused() {
        let dma = MockDma::new();
        let mut raw = [0u8; 16];
        raw[0] = opcode::READ_16;
        raw[10..14].copy_from_slice(&3000u32.to_be_bytes());
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x10_0000, 3000 * 512)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &raw, data);
        // ORBのCDB領域は12バイト
        let err = translate(&cmd, &params(Quirks::MAX_TRANSFER_LIMITED, false), &dma).err().unwrap();
        assert_eq!(err, Sbp2Error::General(GeneralError::NotSupported));
        assert_eq!(dma.live_mappings(), 0);
    }

    #[test]
    fn test_no_split_without_quirk() {
        let dma = MockDma::new();
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x10_0000, 300 * 512)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &read10(0, 300), data);
        let Translation::Orbs { fragments, .. } = translate(&cmd, &params(Quirks::empty(), false), &dma).ok().unwrap()
        else {
            panic!("expected orbs")
        };
        assert_eq!(fragments.len(), 1);
        assert!(matches!(fragments[0].data, DataShape::PageTable(_)));
    }

    #[test]
    fn test_direct_single_segment() {
        let dma = MockDma::new();
        let data = DataBuffer::new(DataDirection::ToDevice, vec![SgSegment::new(0x4000, 4096)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &[opcode::WRITE_10, 0, 0, 0, 0, 0, 0, 0, 8, 0], data);
        let Translation::Orbs { fragments, from_device, .. } =
            translate(&cmd, &params(Quirks::empty(), false), &dma).ok().unwrap()
        else {
            panic!("expected orbs")
        };
        assert!(!from_device);
        assert!(matches!(fragments[0].data, DataShape::Direct(s) if s.len == 4096));

        let orb = build_orb(
            &fragments[0],
            from_device,
            &OrbParams { host: NodeId::local(0), speed: BusSpeed::S400, max_payload: 9 },
            0,
        );
        assert_eq!(orb.misc.data_size, 4096);
        assert!(!orb.misc.page_table_present);
        assert!(orb.misc.notify);
    }

    #[test]
    fn test_inquiry_clamped() {
        let dma = MockDma::new();
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x4000, 96)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &[opcode::INQUIRY, 0, 0, 0, 96, 0], data);
        let Translation::Orbs { fragments, .. } = translate(&cmd, &params(Quirks::INQUIRY_36, false), &dma).ok().unwrap()
        else {
            panic!("expected orbs")
        };
        assert_eq!(fragments[0].cdb[4], 36);
        assert!(matches!(fragments[0].data, DataShape::Direct(s) if s.len == 36));
    }

    #[test]
    fn test_mode_sense_synthesized() {
        let dma = MockDma::new();
        let data = DataBuffer::new(DataDirection::FromDevice, vec![SgSegment::new(0x4000, 64)]);
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &[opcode::MODE_SENSE_6, 0, 0x3F, 0, 64, 0], data);
        let t = translate(&cmd, &params(Quirks::SYNTHESIZE_MODE_SENSE, false), &dma).ok().unwrap();
        assert!(matches!(t, Translation::Synthesized));
        let mut out = [0u8; 4];
        dma.read_physical(0x4000, &mut out);
        assert_eq!(out, [3, 0, 0, 0]);
        assert_eq!(dma.live_mappings(), 0);
    }

    #[test]
    fn test_long_cdb_rejected() {
        let dma = MockDma::new();
        let cmd = ScsiCommand::new(CommandId(1), HANDLE, &[0x88; 16], DataBuffer::none());
        assert!(translate(&cmd, &params(Quirks::empty(), false), &dma).is_err());
    }
}
