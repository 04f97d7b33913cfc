// ============================================================================
// src/dma.rs - DMA Platform Interface
// ============================================================================
//!
//! # DMAプラットフォーム境界
//!
//! ORB・ページテーブル・ログイン応答はコヒーレントメモリに置き、
//! データバッファはコマンド毎にスキャッタ/ギャザーでマッピングする。
//! アドレス変換そのものはプラットフォームの仕事。
//!
//! ## 所有権の遷移
//! ```text
//! DataBuffer (CPU所有) --map--> MappedBuffer (デバイス所有) --unmap--> CPU所有
//! ```
//! `MappedBuffer` はムーブでしか `unmap` に渡せないため、二重解放は
//! コンパイル時に排除される。

use alloc::vec::Vec;

use crate::error::DmaError;

/// 転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// データフェーズなし
    None,
    /// ホストからデバイス（WRITE）
    ToDevice,
    /// デバイスからホスト（READ）
    FromDevice,
}

/// スキャッタ/ギャザーの1区間
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    /// アドレス（マッピング前はCPU物理、マッピング後はバスアドレス）
    pub addr: u64,
    /// 長さ（バイト）
    pub len: u32,
}

impl SgSegment {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// コヒーレントメモリ領域
#[derive(Debug, PartialEq, Eq)]
pub struct DmaRegion {
    /// デバイスから見えるバスアドレス
    pub bus_addr: u64,
    /// 長さ（バイト）
    pub len: usize,
}

/// デバイス所有状態のマッピング済みバッファ
#[derive(Debug)]
pub struct MappedBuffer {
    /// バスアドレスの区間
    pub segments: Vec<SgSegment>,
    /// 転送方向
    pub direction: DataDirection,
    /// プラットフォーム固有の識別子
    pub cookie: u64,
}

impl MappedBuffer {
    /// 全長（バイト）
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len as u64).sum()
    }
}

/// DMAプラットフォーム
pub trait DmaPlatform: Send + Sync {
    /// コヒーレントメモリを確保（ゼロ初期化）
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, DmaError>;

    /// コヒーレントメモリを解放
    fn free_coherent(&self, region: DmaRegion);

    /// コヒーレントメモリへ書き込む
    fn write_coherent(&self, region: &DmaRegion, offset: usize, data: &[u8]);

    /// コヒーレントメモリから読み取る
    fn read_coherent(&self, region: &DmaRegion, offset: usize, out: &mut [u8]);

    /// データバッファをマッピング（CPU -> デバイス所有）
    fn map(&self, segments: &[SgSegment], direction: DataDirection) -> Result<MappedBuffer, DmaError>;

    /// マッピング解除（デバイス -> CPU所有）
    fn unmap(&self, mapping: MappedBuffer);

    /// CPUからマッピング済みバッファへ書き込む（合成応答用）
    ///
    /// 書き込んだバイト数を返す。
    fn copy_to_mapped(&self, mapping: &MappedBuffer, data: &[u8]) -> usize;

    /// マッピング済みバッファからCPUへ読み出す（応答の書き換え用）
    ///
    /// 読み出したバイト数を返す。
    fn copy_from_mapped(&self, mapping: &MappedBuffer, out: &mut [u8]) -> usize;
}

/// バイト区間 `[offset, offset + len)` に対応するサブ区間列を切り出す
///
/// 分割転送のフラグメント毎にデータ記述子を作るために使う。
pub fn slice_segments(segments: &[SgSegment], offset: u64, len: u64) -> Vec<SgSegment> {
    let mut out = Vec::new();
    let mut cursor = 0u64;
    let end = offset + len;

    for seg in segments {
        let seg_start = cursor;
        let seg_end = cursor + seg.len as u64;
        cursor = seg_end;

        if seg_end <= offset {
            continue;
        }
        if seg_start >= end {
            break;
        }

        let from = offset.max(seg_start);
        let to = end.min(seg_end);
        out.push(SgSegment {
            addr: seg.addr + (from - seg_start),
            len: (to - from) as u32,
        });
    }

    out
}
