// ============================================================================
// src/sbp2/orb_pool.rs - Command Descriptor Pool
// ============================================================================
//!
//! # コマンド記述子プール
//!
//! セッション毎に固定数のコマンドORB（+ページテーブル）をコヒーレントメモリに
//! 事前確保し、発行中のリクエストと対応付ける。
//!
//! ## 不変条件
//! - 記述子は空きリスト・使用中リストのちょうど一方に属する
//! - 使用中の記述子は必ず所有リクエストを持つ
//! - 使用中リストが空になったら `last_issued` をクリアする
//!
//! ## リンク（ドアベル最適化）
//! ```text
//! last_issued なし : ORB_POINTER <- 先頭ORBのアドレス
//! last_issued あり : last.next_ORB <- 先頭ORB; fence; DOORBELL
//! 分割フラグメント : 先頭より後ろは告知前にチェーン内でリンク済み (ChainLink::Linked)
//! ```

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};

use super::defs;
use super::orb::{CommandOrb, OrbPointer, PageTableEntry, page_table_to_wire};
use super::translate::ResponseFixup;
use crate::bus::NodeId;
use crate::dma::{DmaPlatform, DmaRegion, MappedBuffer};
use crate::error::DmaError;
use crate::scsi::{CommandId, CommandResult, CompletionCallback};

/// 記述子の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// 空きリスト上
    Free,
    /// 確保済み、記入・リンク中
    Pending,
    /// デバイスに告知済み
    Issued,
}

/// チェーン上の位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    /// 独立に告知される（ポインタ書き込みまたはドアベル）
    Head,
    /// 直前の記述子に連結されるだけ（トランザクション不要）
    Linked,
}

/// コマンドエージェントへの書き込み
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentWrite {
    /// ORB_POINTER にORBアドレスを書く
    OrbPointer(u64),
    /// DOORBELL を鳴らす
    Doorbell,
}

/// コマンド記述子
#[derive(Debug)]
pub struct CommandDescriptor {
    /// ORB (32バイト) + ページテーブル
    region: DmaRegion,
    state: DescriptorState,
    link: ChainLink,
    /// 所有リクエストのスロット
    request: Option<usize>,
}

impl CommandDescriptor {
    pub fn orb_address(&self) -> u64 {
        self.region.bus_addr
    }

    pub fn page_table_address(&self) -> u64 {
        self.region.bus_addr + defs::COMMAND_ORB_SIZE as u64
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    pub fn link(&self) -> ChainLink {
        self.link
    }
}

/// 発行中のリクエスト
pub struct InFlightRequest {
    pub id: CommandId,
    callback: Option<CompletionCallback>,
    mapping: Option<MappedBuffer>,
    fixup: Option<ResponseFixup>,
    /// 未完了のフラグメント数
    remaining: u32,
    /// 最初に記録されたエラー
    result: Option<CommandResult>,
}

impl InFlightRequest {
    pub fn new(id: CommandId, callback: CompletionCallback, mapping: Option<MappedBuffer>) -> Self {
        Self { id, callback: Some(callback), mapping, fixup: None, remaining: 0, result: None }
    }

    pub fn with_fixup(mut self, fixup: Option<ResponseFixup>) -> Self {
        self.fixup = fixup;
        self
    }

    /// 割り当てに失敗したリクエストを分解して返す
    pub fn into_parts(self) -> (Option<CompletionCallback>, Option<MappedBuffer>) {
        (self.callback, self.mapping)
    }
}

/// 全フラグメントが終わったリクエスト
///
/// アダプタロックを離してから `mapping` を解除し、`callback` を呼ぶ。
pub struct FinishedRequest {
    pub id: CommandId,
    pub callback: CompletionCallback,
    pub mapping: Option<MappedBuffer>,
    pub fixup: Option<ResponseFixup>,
    pub result: CommandResult,
}

impl FinishedRequest {
    /// 応答を書き換え、マッピングを解除してコールバックを呼ぶ
    pub fn complete(self, dma: &dyn DmaPlatform) {
        if let Some(mapping) = self.mapping {
            if let (Some(fixup), CommandResult::Good) = (self.fixup, self.result) {
                fixup.apply(dma, &mapping);
            }
            dma.unmap(mapping);
        }
        (self.callback)(self.id, self.result);
    }
}

/// 記述子照合の結果
pub enum StatusMatch {
    /// 一致する使用中記述子がない
    Unmatched,
    /// 記述子を解放した。リクエストはまだ続く
    Released,
    /// リクエストが終わった
    Finished(FinishedRequest),
}

/// セッション毎のコマンド記述子プール
pub struct OrbPool {
    descriptors: Vec<CommandDescriptor>,
    free: Vec<usize>,
    in_use: VecDeque<usize>,
    requests: Vec<Option<InFlightRequest>>,
    last_issued: Option<usize>,
}

impl OrbPool {
    /// `count` 個の記述子をコヒーレントメモリに確保する
    pub fn new(dma: &dyn DmaPlatform, count: usize) -> Result<Self, DmaError> {
        let region_len = defs::COMMAND_ORB_SIZE + defs::PAGE_TABLE_ENTRIES * defs::PAGE_TABLE_ENTRY_SIZE;
        let mut descriptors = Vec::with_capacity(count);
        for _ in 0..count {
            match dma.alloc_coherent(region_len) {
                Ok(region) => descriptors.push(CommandDescriptor {
                    region,
                    state: DescriptorState::Free,
                    link: ChainLink::Head,
                    request: None,
                }),
                Err(e) => {
                    for d in descriptors {
                        dma.free_coherent(d.region);
                    }
                    return Err(e);
                }
            }
        }
        let mut requests = Vec::with_capacity(count);
        requests.resize_with(count, || None);
        Ok(Self {
            free: (0..count).rev().collect(),
            descriptors,
            in_use: VecDeque::with_capacity(count),
            requests,
            last_issued: None,
        })
    }

    /// コヒーレントメモリを返す
    ///
    /// 使用中の記述子が残っている場合は先に `retire_all` すること。
    pub fn destroy(self, dma: &dyn DmaPlatform) {
        debug_assert!(self.in_use.is_empty());
        for d in self.descriptors {
            dma.free_coherent(d.region);
        }
    }

    pub fn capacity(&self) -> usize {
        self.descriptors.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn last_issued(&self) -> Option<usize> {
        self.last_issued
    }

    pub fn descriptor(&self, index: usize) -> &CommandDescriptor {
        &self.descriptors[index]
    }

    /// `fragments` 個の記述子をリクエストに割り当てる
    ///
    /// 足りなければリクエストをそのまま返す（バックプレッシャー）。
    pub fn allocate(&mut self, fragments: usize, mut request: InFlightRequest) -> Result<Vec<usize>, InFlightRequest> {
        if fragments == 0 || self.free.len() < fragments {
            return Err(request);
        }
        let Some(slot) = self.requests.iter().position(|r| r.is_none()) else {
            return Err(request);
        };

        request.remaining = fragments as u32;
        self.requests[slot] = Some(request);

        let mut chain = Vec::with_capacity(fragments);
        for i in 0..fragments {
            // free.len() >= fragments を確認済み
            let Some(index) = self.free.pop() else { break };
            let d = &mut self.descriptors[index];
            d.state = DescriptorState::Pending;
            d.link = if i == 0 { ChainLink::Head } else { ChainLink::Linked };
            d.request = Some(slot);
            self.in_use.push_back(index);
            chain.push(index);
        }
        Ok(chain)
    }

    /// ORB とページテーブルを記述子に書き込む
    pub fn write_orb(&self, dma: &dyn DmaPlatform, index: usize, orb: &CommandOrb, page_table: &[PageTableEntry]) {
        let d = &self.descriptors[index];
        if !page_table.is_empty() {
            dma.write_coherent(&d.region, defs::COMMAND_ORB_SIZE, &page_table_to_wire(page_table));
        }
        dma.write_coherent(&d.region, 0, &orb.to_wire());
    }

    /// チェーンを連結してデバイスに告知する
    ///
    /// 戻り値はコマンドエージェントへの書き込み（アダプタロックの外で行う）。
    pub fn announce(&mut self, dma: &dyn DmaPlatform, host: NodeId, chain: &[usize]) -> Option<AgentWrite> {
        let (&head, &tail) = (chain.first()?, chain.last()?);

        // フラグメント同士を先に連結（告知後に Linked を足すことはない）
        for pair in chain.windows(2) {
            let next = OrbPointer::Address { node: host, address: self.descriptors[pair[1]].orb_address() };
            dma.write_coherent(&self.descriptors[pair[0]].region, CommandOrb::NEXT_ORB_OFFSET, &next.to_wire());
        }

        let head_addr = self.descriptors[head].orb_address();
        let action = match self.last_issued {
            None => AgentWrite::OrbPointer(head_addr),
            Some(prev) => {
                let next = OrbPointer::Address { node: host, address: head_addr };
                dma.write_coherent(&self.descriptors[prev].region, CommandOrb::NEXT_ORB_OFFSET, &next.to_wire());
                AgentWrite::Doorbell
            }
        };
        // リンクの書き込みをレジスタ書き込みより先に見せる
        fence(Ordering::SeqCst);

        for &index in chain {
            self.descriptors[index].state = DescriptorState::Issued;
        }
        self.last_issued = Some(tail);

        if self.descriptors[head].link == ChainLink::Head { Some(action) } else { None }
    }

    /// ステータスのORBアドレス（下位32ビット）で記述子を探して解放する
    pub fn complete(&mut self, orb_lo: u32, result: CommandResult) -> StatusMatch {
        let Some(pos) = self
            .in_use
            .iter()
            .position(|&i| self.descriptors[i].orb_address() as u32 == orb_lo)
        else {
            return StatusMatch::Unmatched;
        };
        let index = self.in_use[pos];
        match self.release(index, result) {
            Some(finished) => StatusMatch::Finished(finished),
            None => StatusMatch::Released,
        }
    }

    /// 記述子を空きリストへ戻す
    ///
    /// リクエスト最後の記述子なら `FinishedRequest` を返す。
    pub fn release(&mut self, index: usize, result: CommandResult) -> Option<FinishedRequest> {
        let pos = self.in_use.iter().position(|&i| i == index)?;
        self.in_use.remove(pos);

        let d = &mut self.descriptors[index];
        d.state = DescriptorState::Free;
        d.link = ChainLink::Head;
        let slot = d.request.take();
        self.free.push(index);

        // 末尾が先に解放されたら、その記述子へは連結しない（再利用されうる）
        if self.last_issued == Some(index) || self.in_use.is_empty() {
            self.last_issued = None;
        }

        let slot = slot?;
        let request = self.requests[slot].as_mut()?;
        request.remaining = request.remaining.saturating_sub(1);
        if !result.is_good() && request.result.is_none() {
            request.result = Some(result);
        }
        if request.remaining > 0 {
            return None;
        }

        let request = self.requests[slot].take()?;
        let callback = request.callback?;
        Some(FinishedRequest {
            id: request.id,
            callback,
            mapping: request.mapping,
            fixup: request.fixup,
            result: request.result.unwrap_or(CommandResult::Good),
        })
    }

    /// 使用中の記述子をすべて `result` で回収する
    pub fn retire_all(&mut self, result: CommandResult) -> Vec<FinishedRequest> {
        let mut finished = Vec::new();
        while let Some(&index) = self.in_use.front() {
            if let Some(f) = self.release(index, result) {
                finished.push(f);
            }
        }
        self.last_issued = None;
        finished
    }

    /// 告知済みの記述子を持つリクエストか（中止不可の判定）
    pub fn is_in_flight(&self, id: CommandId) -> bool {
        self.requests.iter().flatten().any(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDma;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use spin::Mutex;

    fn request(id: u64, log: &Arc<Mutex<Vec<(CommandId, CommandResult)>>>) -> InFlightRequest {
        let log = log.clone();
        InFlightRequest::new(CommandId(id), Box::new(move |id, r| log.lock().push((id, r))), None)
    }

    #[test]
    fn test_allocate_release_restores_pool() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let chain = pool.allocate(1, request(1, &log)).ok().unwrap();
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.descriptor(chain[0]).state(), DescriptorState::Pending);

        pool.release(chain[0], CommandResult::Good).unwrap().complete(&dma);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(*log.lock(), alloc::vec![(CommandId(1), CommandResult::Good)]);
        pool.destroy(&dma);
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn test_backpressure_returns_request() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 2).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let rejected = pool.allocate(3, request(1, &log));
        assert!(rejected.is_err());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_pointer_then_doorbell() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = NodeId::local(0);

        let a = pool.allocate(1, request(1, &log)).ok().unwrap();
        let first = pool.announce(&dma, host, &a);
        assert_eq!(first, Some(AgentWrite::OrbPointer(pool.descriptor(a[0]).orb_address())));

        let b = pool.allocate(1, request(2, &log)).ok().unwrap();
        assert_eq!(pool.announce(&dma, host, &b), Some(AgentWrite::Doorbell));
        assert_eq!(pool.last_issued(), Some(b[0]));

        // A の next_ORB が B を指す
        let mut next = [0u8; 8];
        dma.read_region(pool.descriptor(a[0]).orb_address(), &mut next);
        let hi = u32::from_be_bytes([next[0], next[1], next[2], next[3]]);
        let lo = u32::from_be_bytes([next[4], next[5], next[6], next[7]]);
        assert_eq!(
            OrbPointer::decode(hi, lo),
            OrbPointer::Address { node: host, address: pool.descriptor(b[0]).orb_address() }
        );

        let a_lo = pool.descriptor(a[0]).orb_address() as u32;
        assert!(matches!(pool.complete(a_lo, CommandResult::Good), StatusMatch::Finished(_)));
        assert_eq!(pool.last_issued(), Some(b[0]));

        let b_lo = pool.descriptor(b[0]).orb_address() as u32;
        assert!(matches!(pool.complete(b_lo, CommandResult::Good), StatusMatch::Finished(_)));
        assert_eq!(pool.last_issued(), None);
    }

    #[test]
    fn test_tail_completed_out_of_order() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let host = NodeId::local(0);

        let a = pool.allocate(1, request(1, &log)).ok().unwrap();
        pool.announce(&dma, host, &a);
        let b = pool.allocate(1, request(2, &log)).ok().unwrap();
        assert_eq!(pool.announce(&dma, host, &b), Some(AgentWrite::Doorbell));

        // 末尾の B が A より先に終わる
        let b_lo = pool.descriptor(b[0]).orb_address() as u32;
        assert!(matches!(pool.complete(b_lo, CommandResult::Good), StatusMatch::Finished(_)));
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.last_issued(), None);

        // 次のコマンドは解放済みの B に連結せず、ポインタを書き直す
        let c = pool.allocate(1, request(3, &log)).ok().unwrap();
        let action = pool.announce(&dma, host, &c);
        assert_eq!(action, Some(AgentWrite::OrbPointer(pool.descriptor(c[0]).orb_address())));
        assert_eq!(pool.last_issued(), Some(c[0]));

        let a_lo = pool.descriptor(a[0]).orb_address() as u32;
        assert!(matches!(pool.complete(a_lo, CommandResult::Good), StatusMatch::Finished(_)));
        assert_eq!(pool.last_issued(), Some(c[0]));
    }

    #[test]
    fn test_fragments_single_callback() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let chain = pool.allocate(3, request(7, &log)).ok().unwrap();
        assert_eq!(pool.descriptor(chain[0]).link(), ChainLink::Head);
        assert_eq!(pool.descriptor(chain[1]).link(), ChainLink::Linked);
        assert_eq!(pool.descriptor(chain[2]).link(), ChainLink::Linked);
        pool.announce(&dma, NodeId::local(0), &chain);

        for (n, &i) in chain.iter().enumerate() {
            let lo = pool.descriptor(i).orb_address() as u32;
            match pool.complete(lo, CommandResult::Good) {
                StatusMatch::Finished(f) => {
                    assert_eq!(n, 2);
                    f.complete(&dma);
                }
                StatusMatch::Released => assert!(n < 2),
                StatusMatch::Unmatched => panic!("fragment not found"),
            }
        }
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_unmatched_status() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 2).unwrap();
        assert!(matches!(pool.complete(0xDEAD_BEEF, CommandResult::Good), StatusMatch::Unmatched));
    }

    #[test]
    fn test_retire_all_keeps_first_error() {
        let dma = MockDma::new();
        let mut pool = OrbPool::new(&dma, 4).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = pool.allocate(2, request(1, &log)).ok().unwrap();
        pool.allocate(1, request(2, &log)).ok().unwrap();
        pool.announce(&dma, NodeId::local(0), &chain);

        assert!(pool.release(chain[0], CommandResult::TransportError).is_none());
        let finished = pool.retire_all(CommandResult::BusyRetry);
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].result, CommandResult::TransportError);
        assert_eq!(finished[1].result, CommandResult::BusyRetry);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.last_issued(), None);
    }
}
