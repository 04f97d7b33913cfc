// ============================================================================
// src/sbp2/discovery.rs - Topology Scanner
// ============================================================================
//!
//! # トポロジ走査
//!
//! バスリセット後、ローカルノード以外の全ノードについて
//! 1. バス情報ブロックのシグネチャ ("1394") を有界再試行で読む
//! 2. ルートディレクトリからユニットディレクトリ (0xD1) をたどる
//! 3. 仕様ID/バージョンでストレージプロトコルのユニットを選ぶ
//! 4. 論理ユニット毎に `DiscoveredUnit` を返す
//!
//! 読めないノード・プロトコルが一致しないノードは黙って飛ばす。

use alloc::vec::Vec;

use super::config_rom::{BusInfoBlock, Directory, LogicalUnit, UnitInfo};
use super::defs::{self, key};
use crate::bus::{BusTransport, Generation, NodeId, read_with_retries};
use crate::error::{ConfigRomError, Sbp2Error};

/// ディレクトリ長の上限（Config ROM は 1KB）
const MAX_DIRECTORY_QUADLETS: u16 = 256;

/// 走査で見つかった論理ユニット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUnit {
    pub node: NodeId,
    pub bus_info: BusInfoBlock,
    pub unit: UnitInfo,
    pub lun: LogicalUnit,
}

impl DiscoveredUnit {
    pub fn guid(&self) -> u64 {
        self.bus_info.guid
    }
}

/// Config ROM 読み取り器（ノード + 世代 + 再試行回数）
struct RomReader<'a> {
    bus: &'a dyn BusTransport,
    node: NodeId,
    generation: Generation,
    retries: u32,
}

impl RomReader<'_> {
    async fn quadlet(&self, address: u64) -> Result<u32, Sbp2Error> {
        let bytes = read_with_retries(self.bus, self.node, self.generation, address, 4, self.retries).await?;
        if bytes.len() < 4 {
            return Err(ConfigRomError::Truncated.into());
        }
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn quadlets(&self, address: u64, count: usize) -> Result<Vec<u32>, Sbp2Error> {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(self.quadlet(address + (i as u64) * 4).await?);
        }
        Ok(out)
    }

    async fn directory(&self, address: u64) -> Result<Directory, Sbp2Error> {
        let header = self.quadlet(address).await?;
        let length = (header >> 16) as u16;
        if length > MAX_DIRECTORY_QUADLETS {
            return Err(ConfigRomError::BadOffset.into());
        }
        let body = self.quadlets(address + 4, length as usize).await?;
        let dir = Directory::parse(address, header, &body)?;
        if !dir.crc_ok {
            log::warn!("[SBP2] {:?}: directory at {:#x} has bad CRC", self.node, address);
        }
        Ok(dir)
    }
}

/// 1ノードを調べる
pub async fn probe_node(
    bus: &dyn BusTransport,
    node: NodeId,
    generation: Generation,
    retries: u32,
) -> Result<Vec<DiscoveredUnit>, Sbp2Error> {
    let rom = RomReader { bus, node, generation, retries };

    if rom.quadlet(defs::BUS_INFO_SIGNATURE_ADDR).await? != defs::BUS_INFO_SIGNATURE {
        return Err(ConfigRomError::BadSignature.into());
    }
    let info = rom.quadlets(defs::CONFIG_ROM_BASE, defs::BUS_INFO_QUADLETS as usize).await?;
    let bus_info = BusInfoBlock::parse(&info)?;

    let root = rom.directory(defs::ROOT_DIRECTORY_ADDR).await?;
    let model_fallback = root.immediate(key::MODEL_ID).unwrap_or(0);

    let mut found = Vec::new();
    let unit_dirs: Vec<(u64, _)> = root.find_all(key::UNIT_DIRECTORY).collect();
    for (entry_addr, entry) in unit_dirs {
        let Some(addr) = entry.target_address(entry_addr) else { continue };
        let unit_dir = rom.directory(addr).await?;
        if !UnitInfo::is_sbp2(&unit_dir) {
            continue;
        }

        // 論理ユニットディレクトリ (0xD4) 内の LUN
        let mut extra = Vec::new();
        let lu_dirs: Vec<(u64, _)> = unit_dir.find_all(key::LOGICAL_UNIT_DIRECTORY).collect();
        for (lu_entry_addr, lu_entry) in lu_dirs {
            let Some(lu_addr) = lu_entry.target_address(lu_entry_addr) else { continue };
            let lu_dir = rom.directory(lu_addr).await?;
            extra.extend(lu_dir.find_all(key::LOGICAL_UNIT_NUMBER).map(|(_, e)| LogicalUnit::from_value(e.value)));
        }

        let unit = UnitInfo::from_directory(&unit_dir, model_fallback, &extra)?;
        for lun in unit.logical_units.iter().copied() {
            found.push(DiscoveredUnit { node, bus_info, unit: unit.clone(), lun });
        }
    }
    Ok(found)
}

/// ローカルノード以外の全ノードを走査する
pub async fn scan_bus(bus: &dyn BusTransport, generation: Generation, retries: u32) -> Vec<DiscoveredUnit> {
    let local = bus.local_node();
    let mut units = Vec::new();
    for phy in 0..bus.node_count() {
        let node = NodeId::local(phy);
        if node.phy_id() == local.phy_id() {
            continue;
        }
        match probe_node(bus, node, generation, retries).await {
            Ok(found) => {
                for u in &found {
                    log::info!(
                        "[SBP2] {:?}: storage unit guid={:016x} lun={} type={:#x}",
                        node,
                        u.guid(),
                        u.lun.lun,
                        u.lun.device_type
                    );
                }
                units.extend(found);
            }
            Err(e) => log::debug!("[SBP2] {:?}: skipped ({})", node, e),
        }
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBus, MockDevice, MockDma};

    #[test]
    fn test_scan_finds_device_and_skips_others() {
        let dma = MockDma::new();
        let bus = MockBus::new(dma.clone());
        bus.attach(NodeId::local(1), MockDevice::new(0x0011_2233_4455_6677));
        bus.attach_foreign(NodeId::local(2));
        bus.set_node_count(4);

        let units = pollster::block_on(scan_bus(&bus, bus.current_generation(), 2));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].node, NodeId::local(1));
        assert_eq!(units[0].guid(), 0x0011_2233_4455_6677);
        assert_eq!(units[0].lun.lun, 0);
        assert_eq!(units[0].unit.management_agent, MockDevice::MANAGEMENT_AGENT);
    }

    #[test]
    fn test_probe_retries_timeouts() {
        let dma = MockDma::new();
        let bus = MockBus::new(dma.clone());
        bus.attach(NodeId::local(1), MockDevice::new(1));
        bus.fail_next_reads(NodeId::local(1), 2);
        let units = pollster::block_on(probe_node(&bus, NodeId::local(1), bus.current_generation(), 3)).unwrap();
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn test_probe_gives_up_after_retries() {
        let dma = MockDma::new();
        let bus = MockBus::new(dma.clone());
        bus.attach(NodeId::local(1), MockDevice::new(1));
        bus.fail_next_reads(NodeId::local(1), 5);
        assert!(pollster::block_on(probe_node(&bus, NodeId::local(1), bus.current_generation(), 1)).is_err());
    }

    #[test]
    fn test_multiple_luns() {
        let dma = MockDma::new();
        let bus = MockBus::new(dma.clone());
        bus.attach(NodeId::local(1), MockDevice::new(9).with_luns(&[0, 1]));
        let units = pollster::block_on(probe_node(&bus, NodeId::local(1), bus.current_generation(), 0)).unwrap();
        let luns: Vec<u16> = units.iter().map(|u| u.lun.lun).collect();
        assert_eq!(luns, alloc::vec![0, 1]);
    }
}
