// ============================================================================
// src/testing.rs - Test Doubles
// ============================================================================
//!
//! テスト用のバス・DMA・タイマーと、ストレージデバイスのエミュレーション。
//!
//! `MockBus` は書き込みを同期的に処理する。管理エージェントへの書き込みは
//! その場でステータスをシンクへ配送するので、ログイン等は一度のポーリングで終わる。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::bus::{
    BusFuture, BusResetListener, BusSpeed, BusTransport, Generation, NodeId, PacketCompletion, StatusRange,
    StatusSink,
};
use crate::dma::{DataDirection, DmaPlatform, DmaRegion, MappedBuffer, SgSegment};
use crate::error::{BusError, DmaError};
use crate::sbp2::config_rom::{DirectoryEntry, LogicalUnit, UnitCharacteristics, UnitInfo, encode_directory};
use crate::sbp2::defs::{self, agent, key};
use crate::sbp2::orb::{LoginResponse, ManagementFunction, decode_management_misc};
use crate::sbp2::packet_pool::RequestPacket;
use crate::sbp2::status::{Response, encode_status};
use crate::time::Timer;

// ============================================================================
// Timer
// ============================================================================

/// 仮想時計。`sleep_ms` は時刻を進めて即座に完了する
pub struct MockTimer {
    now: AtomicU64,
}

impl MockTimer {
    pub fn new() -> Self {
        Self { now: AtomicU64::new(0) }
    }

    pub fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Timer for MockTimer {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, duration_ms: u64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.now.fetch_add(duration_ms, Ordering::SeqCst);
        Box::pin(core::future::ready(()))
    }
}

// ============================================================================
// DMA
// ============================================================================

const COHERENT_BASE: u64 = 0x8000_0000;

#[derive(Default)]
struct DmaState {
    memory: HashMap<u64, u8>,
    next_coherent: u64,
    regions: usize,
    mappings: usize,
    next_cookie: u64,
    fail_maps: bool,
}

/// アイデンティティマッピングのDMA。メモリは疎なバイト配列
#[derive(Clone, Default)]
pub struct MockDma {
    state: Arc<Mutex<DmaState>>,
}

impl MockDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解放されていないコヒーレント領域の数
    pub fn live_regions(&self) -> usize {
        self.state.lock().regions
    }

    /// 解除されていないマッピングの数
    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings
    }

    /// 以後の `map` を失敗させる
    pub fn fail_maps(&self, fail: bool) {
        self.state.lock().fail_maps = fail;
    }

    pub fn read_region(&self, addr: u64, out: &mut [u8]) {
        self.read_physical(addr, out);
    }

    pub fn read_physical(&self, addr: u64, out: &mut [u8]) {
        let state = self.state.lock();
        for (i, b) in out.iter_mut().enumerate() {
            *b = state.memory.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
    }

    pub fn write_physical(&self, addr: u64, data: &[u8]) {
        let mut state = self.state.lock();
        for (i, b) in data.iter().enumerate() {
            state.memory.insert(addr + i as u64, *b);
        }
    }

    /// バスアドレスの8バイトをビッグエンディアンのクワッドレット2つとして読む
    pub fn read_quadlets(&self, addr: u64, out: &mut [u32]) {
        let mut raw = vec![0u8; out.len() * 4];
        self.read_physical(addr, &mut raw);
        for (q, chunk) in out.iter_mut().zip(raw.chunks_exact(4)) {
            *q = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }
}

impl DmaPlatform for MockDma {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, DmaError> {
        let bus_addr = {
            let mut state = self.state.lock();
            let addr = COHERENT_BASE + state.next_coherent;
            // 32バイト境界
            state.next_coherent += (len as u64).div_ceil(32) * 32;
            state.regions += 1;
            addr
        };
        self.write_physical(bus_addr, &vec![0u8; len]);
        Ok(DmaRegion { bus_addr, len })
    }

    fn free_coherent(&self, _region: DmaRegion) {
        self.state.lock().regions -= 1;
    }

    fn write_coherent(&self, region: &DmaRegion, offset: usize, data: &[u8]) {
        self.write_physical(region.bus_addr + offset as u64, data);
    }

    fn read_coherent(&self, region: &DmaRegion, offset: usize, out: &mut [u8]) {
        self.read_physical(region.bus_addr + offset as u64, out);
    }

    fn map(&self, segments: &[SgSegment], direction: DataDirection) -> Result<MappedBuffer, DmaError> {
        let mut state = self.state.lock();
        if state.fail_maps {
            return Err(DmaError::MappingFailed);
        }
        state.mappings += 1;
        state.next_cookie += 1;
        Ok(MappedBuffer { segments: segments.to_vec(), direction, cookie: state.next_cookie })
    }

    fn unmap(&self, _mapping: MappedBuffer) {
        self.state.lock().mappings -= 1;
    }

    fn copy_to_mapped(&self, mapping: &MappedBuffer, data: &[u8]) -> usize {
        let mut done = 0;
        for seg in &mapping.segments {
            if done == data.len() {
                break;
            }
            let n = (seg.len as usize).min(data.len() - done);
            self.write_physical(seg.addr, &data[done..done + n]);
            done += n;
        }
        done
    }

    fn copy_from_mapped(&self, mapping: &MappedBuffer, out: &mut [u8]) -> usize {
        let mut done = 0;
        for seg in &mapping.segments {
            if done == out.len() {
                break;
            }
            let n = (seg.len as usize).min(out.len() - done);
            self.read_physical(seg.addr, &mut out[done..done + n]);
            done += n;
        }
        done
    }
}

// ============================================================================
// Device Emulation
// ============================================================================

/// 単純なユニットディレクトリ（管理エージェント 0x4000 のみ）
pub fn test_unit_info() -> UnitInfo {
    UnitInfo {
        management_agent: MockDevice::MANAGEMENT_AGENT,
        command_set_spec_id: defs::SBP2_UNIT_SPEC_ID,
        command_set: defs::SCSI_COMMAND_SET,
        characteristics: UnitCharacteristics::default(),
        firmware_revision: 0,
        model_id: 0,
        logical_units: vec![LogicalUnit { lun: 0, device_type: defs::DEVICE_TYPE_DISK, ordered: false }],
    }
}

/// エミュレートするストレージデバイス
#[derive(Debug, Clone)]
pub struct MockDevice {
    guid: u64,
    luns: Vec<u16>,
    device_type: u8,
    model_id: u32,
    firmware_revision: u32,
    max_rec: u8,
    reject_login: bool,
    reject_reconnect: bool,
    mute: bool,
    login_id: Option<u16>,
    next_login_id: u16,
    status_fifo: Option<u64>,
    logins: u32,
    reconnects: u32,
    logouts: u32,
}

impl MockDevice {
    /// ユニットディレクトリの管理エージェント (CSRオフセット 0x4000)
    pub const MANAGEMENT_AGENT: u64 = defs::CSR_REGISTER_BASE + 0x4000 * 4;
    /// ログイン応答で返すコマンドエージェント
    pub const COMMAND_AGENT: u64 = defs::CSR_REGISTER_BASE + 0x2_0000;

    pub fn new(guid: u64) -> Self {
        Self {
            guid,
            luns: vec![0],
            device_type: defs::DEVICE_TYPE_DISK,
            model_id: 0x00_1234,
            firmware_revision: 0x00_0100,
            max_rec: 10,
            reject_login: false,
            reject_reconnect: false,
            mute: false,
            login_id: None,
            next_login_id: 1,
            status_fifo: None,
            logins: 0,
            reconnects: 0,
            logouts: 0,
        }
    }

    pub fn with_luns(mut self, luns: &[u16]) -> Self {
        self.luns = luns.to_vec();
        self
    }

    pub fn with_device_type(mut self, device_type: u8) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_firmware(mut self, firmware_revision: u32, model_id: u32) -> Self {
        self.firmware_revision = firmware_revision;
        self.model_id = model_id;
        self
    }

    pub fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    /// 管理ORBにステータスを返さない
    pub fn mute(mut self) -> Self {
        self.mute = true;
        self
    }

    /// Config ROM（CONFIG_ROM_BASE からのクワッドレット列）
    fn rom(&self) -> Vec<u32> {
        let mut rom = vec![
            0x0404_0000,
            defs::BUS_INFO_SIGNATURE,
            0xE000_0002 | ((self.max_rec as u32 & 0xF) << 12),
            (self.guid >> 32) as u32,
            self.guid as u32,
        ];

        // ルートディレクトリ: ユニットディレクトリは直後に置く
        let root = encode_directory(&[
            DirectoryEntry::new(key::VENDOR_ID, 0x00_A0B8),
            DirectoryEntry::new(key::MODEL_ID, self.model_id),
            DirectoryEntry::new(key::UNIT_DIRECTORY, 1),
        ]);
        rom.extend(root);

        let mut unit = vec![
            DirectoryEntry::new(key::UNIT_SPEC_ID, defs::SBP2_UNIT_SPEC_ID),
            DirectoryEntry::new(key::UNIT_SW_VERSION, defs::SBP2_SW_VERSION),
            DirectoryEntry::new(key::COMMAND_SET_SPEC_ID, defs::SBP2_UNIT_SPEC_ID),
            DirectoryEntry::new(key::COMMAND_SET, defs::SCSI_COMMAND_SET),
            DirectoryEntry::new(key::UNIT_CHARACTERISTICS, 0x0A08),
            DirectoryEntry::new(key::FIRMWARE_REVISION, self.firmware_revision),
            DirectoryEntry::new(key::MANAGEMENT_AGENT, 0x4000),
        ];
        for &lun in &self.luns {
            unit.push(DirectoryEntry::new(key::LOGICAL_UNIT_NUMBER, ((self.device_type as u32) << 16) | lun as u32));
        }
        rom.extend(encode_directory(&unit));
        rom
    }
}

// ============================================================================
// Bus
// ============================================================================

/// 記録したポスト書き込み
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedWrite {
    pub node: NodeId,
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct BusState {
    generation: u32,
    node_count: Option<u8>,
    devices: HashMap<u8, MockDevice>,
    foreign: Vec<u8>,
    silent: Vec<u8>,
    read_failures: HashMap<u8, u32>,
    sinks: Vec<(StatusRange, Arc<dyn StatusSink>)>,
    listeners: Vec<Arc<dyn BusResetListener>>,
    posted: Vec<PostedWrite>,
    writes: Vec<PostedWrite>,
    hold_packets: bool,
    held: Vec<(RequestPacket, Arc<dyn PacketCompletion>)>,
    fetch_head: HashMap<u8, u64>,
}

/// エミュレーションバス。ローカルノードは物理ID 0
pub struct MockBus {
    dma: MockDma,
    state: Mutex<BusState>,
}

impl MockBus {
    pub fn new(dma: MockDma) -> Self {
        Self { dma, state: Mutex::new(BusState::default()) }
    }

    pub fn attach(&self, node: NodeId, device: MockDevice) {
        self.state.lock().devices.insert(node.phy_id(), device);
    }

    /// 別プロトコルのノード（シグネチャが一致しない）
    pub fn attach_foreign(&self, node: NodeId) {
        self.state.lock().foreign.push(node.phy_id());
    }

    pub fn detach(&self, node: NodeId) {
        let mut state = self.state.lock();
        state.devices.remove(&node.phy_id());
        state.foreign.retain(|&p| p != node.phy_id());
    }

    pub fn set_node_count(&self, count: u8) {
        self.state.lock().node_count = Some(count);
    }

    /// 次の `count` 回の読み取りを応答なしにする
    pub fn fail_next_reads(&self, node: NodeId, count: u32) {
        self.state.lock().read_failures.insert(node.phy_id(), count);
    }

    /// 書き込みは成功するが何も起きないノード
    pub fn accept_writes_silently(&self, node: NodeId) {
        self.state.lock().silent.push(node.phy_id());
    }

    /// ポスト書き込みのパケットを返却せずに保持する
    pub fn hold_packets(&self, hold: bool) {
        self.state.lock().hold_packets = hold;
    }

    /// 保持していたパケットを完了させる
    pub fn release_held(&self) {
        let held = core::mem::take(&mut self.state.lock().held);
        for (packet, done) in held {
            done.posted_write_done(packet, Ok(()));
        }
    }

    /// ノード宛てのポスト書き込み
    pub fn posted(&self, node: NodeId) -> Vec<PostedWrite> {
        self.state.lock().posted.iter().filter(|w| w.node == node).cloned().collect()
    }

    /// ノード宛ての（応答を待つ）書き込み。管理エージェント宛ては除く
    pub fn writes(&self, node: NodeId) -> Vec<PostedWrite> {
        self.state.lock().writes.iter().filter(|w| w.node == node).cloned().collect()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.posted.clear();
        state.writes.clear();
    }

    fn device_stat(&self, node: NodeId, f: impl Fn(&MockDevice) -> u32) -> u32 {
        self.state.lock().devices.get(&node.phy_id()).map(f).unwrap_or(0)
    }

    pub fn logins(&self, node: NodeId) -> u32 {
        self.device_stat(node, |d| d.logins)
    }

    pub fn reconnects(&self, node: NodeId) -> u32 {
        self.device_stat(node, |d| d.reconnects)
    }

    pub fn logouts(&self, node: NodeId) -> u32 {
        self.device_stat(node, |d| d.logouts)
    }

    pub fn set_reject_reconnect(&self, node: NodeId, reject: bool) {
        if let Some(d) = self.state.lock().devices.get_mut(&node.phy_id()) {
            d.reject_reconnect = reject;
        }
    }

    /// 最後の ORB_POINTER 書き込みから next_ORB をたどったORBアドレス列
    pub fn fetch_chain(&self, node: NodeId) -> Vec<u64> {
        let Some(mut addr) = self.state.lock().fetch_head.get(&node.phy_id()).copied() else {
            return Vec::new();
        };
        let mut chain = vec![addr];
        loop {
            let mut next = [0u32; 2];
            self.dma.read_quadlets(addr, &mut next);
            // null ビット
            if next[0] & 0x8000_0000 != 0 || chain.len() > 64 {
                break;
            }
            addr = ((next[0] as u64 & 0xFFFF) << 32) | next[1] as u64;
            chain.push(addr);
        }
        chain
    }

    /// ORBのステータスをデバイスとして書き込む
    pub fn complete_orb(&self, node: NodeId, orb: u64, command_set: Option<&[u8]>) {
        let status = encode_status(Response::RequestComplete, false, orb, command_set);
        self.send_status(node, &status);
    }

    /// 任意のバイト列をノードのステータスFIFOへ書き込む
    pub fn send_status(&self, node: NodeId, data: &[u8]) {
        let fifo = self.state.lock().devices.get(&node.phy_id()).and_then(|d| d.status_fifo);
        if let Some(fifo) = fifo {
            self.deliver(node, fifo, data);
        }
    }

    /// バスリセット（トポロジ変化を伴うテスト用）
    pub fn trigger_reset(&self) {
        let listeners = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.listeners.clone()
        };
        let generation = self.current_generation();
        for l in listeners {
            l.bus_reset(generation);
        }
    }

    fn deliver(&self, node: NodeId, fifo: u64, data: &[u8]) {
        let sink = self
            .state
            .lock()
            .sinks
            .iter()
            .find(|(range, _)| range.contains(fifo))
            .map(|(_, sink)| sink.clone());
        if let Some(sink) = sink {
            sink.status_write(node, data);
        }
    }

    /// 管理エージェントへのORBポインタ書き込みを処理する
    fn management_write(&self, node: NodeId, pointer: &[u8]) {
        if pointer.len() < 8 {
            return;
        }
        let hi = u32::from_be_bytes([pointer[0], pointer[1], pointer[2], pointer[3]]);
        let lo = u32::from_be_bytes([pointer[4], pointer[5], pointer[6], pointer[7]]);
        let orb_addr = ((hi as u64 & 0xFFFF) << 32) | lo as u64;
        let mut q = [0u32; 8];
        self.dma.read_quadlets(orb_addr, &mut q);
        let (function, arg) = decode_management_misc(q[4]);
        let fifo = ((q[6] as u64 & 0xFFFF) << 32) | q[7] as u64;

        let mut response = None;
        let accepted = {
            let mut state = self.state.lock();
            let Some(device) = state.devices.get_mut(&node.phy_id()) else { return };
            if device.mute {
                return;
            }
            device.status_fifo = Some(fifo);
            if function == ManagementFunction::Login as u8 {
                device.logins += 1;
                if device.reject_login {
                    false
                } else {
                    let login_id = device.next_login_id;
                    device.next_login_id += 1;
                    device.login_id = Some(login_id);
                    let resp_addr = ((q[2] as u64 & 0xFFFF) << 32) | q[3] as u64;
                    response = Some((resp_addr, login_id));
                    true
                }
            } else if function == ManagementFunction::Reconnect as u8 {
                device.reconnects += 1;
                !device.reject_reconnect && device.login_id == Some(arg)
            } else if function == ManagementFunction::Logout as u8 {
                device.logouts += 1;
                let ok = device.login_id == Some(arg);
                if ok {
                    device.login_id = None;
                }
                ok
            } else {
                false
            }
        };

        if let Some((resp_addr, login_id)) = response {
            let resp = LoginResponse {
                length: defs::LOGIN_RESPONSE_SIZE as u16,
                login_id,
                command_agent: MockDevice::COMMAND_AGENT,
                reconnect_hold: 0,
            };
            self.dma.write_physical(resp_addr, &resp.to_wire());
        }
        let mut status = encode_status(Response::RequestComplete, false, orb_addr, None);
        if !accepted {
            // sbp_status: function rejected
            status[1] = 0x04;
        }
        self.deliver(node, fifo, &status);
    }
}

impl BusTransport for MockBus {
    fn local_node(&self) -> NodeId {
        NodeId::local(0)
    }

    fn node_count(&self) -> u8 {
        let state = self.state.lock();
        state.node_count.unwrap_or_else(|| {
            let max = state.devices.keys().chain(state.foreign.iter()).copied().max().unwrap_or(0);
            max + 1
        })
    }

    fn current_generation(&self) -> Generation {
        Generation(self.state.lock().generation)
    }

    fn node_speed(&self, _node: NodeId) -> BusSpeed {
        BusSpeed::S400
    }

    fn max_rec(&self) -> u8 {
        10
    }

    fn read(&self, node: NodeId, generation: Generation, address: u64, len: usize) -> BusFuture<'_, Vec<u8>> {
        let result = (|| {
            let mut state = self.state.lock();
            if Generation(state.generation) != generation {
                return Err(BusError::GenerationMismatch);
            }
            let phy = node.phy_id();
            if let Some(left) = state.read_failures.get_mut(&phy) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BusError::Timeout);
                }
            }
            if state.foreign.contains(&phy) {
                return Ok(vec![0u8; len]);
            }
            let device = state.devices.get(&phy).ok_or(BusError::NoSuchNode)?;
            if address < defs::CONFIG_ROM_BASE {
                return Err(BusError::NegativeAck);
            }
            let rom = device.rom();
            let start = ((address - defs::CONFIG_ROM_BASE) / 4) as usize;
            let mut out = Vec::with_capacity(len);
            for i in 0..len.div_ceil(4) {
                let q = rom.get(start + i).copied().unwrap_or(0);
                out.extend_from_slice(&q.to_be_bytes());
            }
            out.truncate(len);
            Ok(out)
        })();
        Box::pin(async move { result })
    }

    fn write<'a>(&'a self, node: NodeId, generation: Generation, address: u64, data: &'a [u8]) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let is_management = {
                let mut state = self.state.lock();
                if Generation(state.generation) != generation {
                    return Err(BusError::GenerationMismatch);
                }
                let phy = node.phy_id();
                if state.silent.contains(&phy) {
                    return Ok(());
                }
                if !state.devices.contains_key(&phy) {
                    return Err(BusError::Timeout);
                }
                if address == MockDevice::MANAGEMENT_AGENT {
                    true
                } else {
                    state.writes.push(PostedWrite { node, address, data: data.to_vec() });
                    false
                }
            };
            if is_management {
                self.management_write(node, data);
            }
            Ok(())
        })
    }

    fn post_write(
        &self,
        node: NodeId,
        generation: Generation,
        address: u64,
        packet: RequestPacket,
        done: Arc<dyn PacketCompletion>,
    ) {
        let result = {
            let mut state = self.state.lock();
            if Generation(state.generation) != generation {
                Err(BusError::GenerationMismatch)
            } else {
                let data = packet.data().to_vec();
                if address == MockDevice::COMMAND_AGENT + agent::ORB_POINTER && data.len() == 8 {
                    let hi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    let lo = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                    state.fetch_head.insert(node.phy_id(), ((hi as u64 & 0xFFFF) << 32) | lo as u64);
                }
                state.posted.push(PostedWrite { node, address, data });
                if state.hold_packets {
                    state.held.push((packet, done));
                    return;
                }
                Ok(())
            }
        };
        done.posted_write_done(packet, result);
    }

    fn register_status_sink(&self, range: StatusRange, sink: Arc<dyn StatusSink>) -> Result<(), BusError> {
        let mut state = self.state.lock();
        let overlaps = state
            .sinks
            .iter()
            .any(|(r, _)| range.base < r.base + r.len as u64 && r.base < range.base + range.len as u64);
        if overlaps {
            return Err(BusError::AddressInUse);
        }
        state.sinks.push((range, sink));
        Ok(())
    }

    fn unregister_status_sink(&self, range: StatusRange) {
        self.state.lock().sinks.retain(|(r, _)| *r != range);
    }

    fn on_bus_reset(&self, listener: Arc<dyn BusResetListener>) {
        self.state.lock().listeners.push(listener);
    }

    fn reset_bus(&self) -> Result<(), BusError> {
        self.trigger_reset();
        Ok(())
    }
}
