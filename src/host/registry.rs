// ============================================================================
// src/host/registry.rs - Host Adapter Registry
// ============================================================================
//!
//! # アダプタレジストリ
//!
//! バス層がアダプタの追加・削除を報告する窓口。
//! グローバルインスタンスは `adapter_registry()` で取得する。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::RwLock;

use super::{ExportedDevice, HostAdapter};
use crate::bus::BusTransport;
use crate::config::DriverConfig;
use crate::dma::DmaPlatform;
use crate::error::{GeneralError, Sbp2Error};
use crate::time::Timer;

/// ホストアダプタの一覧
pub struct HostAdapterRegistry {
    adapters: RwLock<HashMap<u32, Arc<HostAdapter>>>,
    next_id: AtomicU32,
}

impl HostAdapterRegistry {
    pub fn new() -> Self {
        Self { adapters: RwLock::new(HashMap::new()), next_id: AtomicU32::new(0) }
    }

    /// アダプタを追加する
    ///
    /// 戻り値のアダプタの `run_worker` をエグゼキュータに spawn すること。
    pub fn add_adapter(
        &self,
        bus: Arc<dyn BusTransport>,
        dma: Arc<dyn DmaPlatform>,
        timer: Arc<dyn Timer>,
        config: DriverConfig,
    ) -> Result<Arc<HostAdapter>, Sbp2Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let adapter = HostAdapter::new(id, bus, dma, timer, config)?;
        self.adapters.write().insert(id, adapter.clone());
        Ok(adapter)
    }

    pub fn get(&self, id: u32) -> Option<Arc<HostAdapter>> {
        self.adapters.read().get(&id).cloned()
    }

    /// 登録中のアダプタ（ID順）
    pub fn adapters(&self) -> Vec<Arc<HostAdapter>> {
        let mut list: Vec<_> = self.adapters.read().values().cloned().collect();
        list.sort_by_key(|a| a.id());
        list
    }

    /// 全アダプタの公開デバイス
    pub fn devices(&self) -> Vec<(u32, ExportedDevice)> {
        self.adapters()
            .iter()
            .flat_map(|a| {
                let id = a.id();
                a.devices().into_iter().map(move |d| (id, d))
            })
            .collect()
    }

    /// アダプタを外す: 全セッションをログアウトし、保留コマンドを終わらせる
    pub async fn remove_adapter(&self, id: u32) -> Result<(), Sbp2Error> {
        let adapter = self.adapters.write().remove(&id).ok_or(GeneralError::NoSuchAdapter)?;
        adapter.shutdown().await;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HostAdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref ADAPTER_REGISTRY: HostAdapterRegistry = HostAdapterRegistry::new();
}

/// グローバルなアダプタレジストリ
pub fn adapter_registry() -> &'static HostAdapterRegistry {
    &ADAPTER_REGISTRY
}
