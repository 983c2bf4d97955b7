//! Link service — multi-link manager.
//!
//! Owns all attached links, keyed by a service-assigned ID, and
//! forwards packet I/O and statistics queries to the right session.

use crate::link::session::{self, LinkHandle};
use crate::link::transport::LinkTransport;
use crate::link::types::{LinkConfig, LinkError, LinkInfo, LinkStats};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared service instance type.
pub type LinkServiceState = Arc<LinkService>;

/// Central link service.
pub struct LinkService {
    links: RwLock<HashMap<String, Arc<LinkHandle>>>,
}

impl LinkService {
    /// Create a new service instance (wrapped in `Arc`).
    pub fn new() -> LinkServiceState {
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
        })
    }

    // ── Link management ───────────────────────────────────────────

    /// Attach a new link over the transport selected by the config.
    pub async fn attach(&self, config: LinkConfig) -> Result<LinkInfo, LinkError> {
        self.guard_duplicate_endpoint(&config).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let handle = session::attach(id.clone(), config).await?;
        self.register(id, handle).await
    }

    /// Attach a new link over an already-open transport.
    pub async fn attach_with(
        &self,
        config: LinkConfig,
        transport: Arc<dyn LinkTransport>,
    ) -> Result<LinkInfo, LinkError> {
        self.guard_duplicate_endpoint(&config).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let handle = session::attach_with(id.clone(), config, transport);
        self.register(id, handle).await
    }

    async fn register(&self, id: String, handle: Arc<LinkHandle>) -> Result<LinkInfo, LinkError> {
        let info = handle.info().await;
        log::info!(
            "[fakewire] attached link {} ({} on {})",
            id,
            info.label,
            info.path
        );
        let mut links = self.links.write().await;
        links.insert(id, handle);
        Ok(info)
    }

    async fn guard_duplicate_endpoint(&self, config: &LinkConfig) -> Result<(), LinkError> {
        let links = self.links.read().await;
        for handle in links.values() {
            let other = handle.config();
            if other.path == config.path && other.mode == config.mode && handle.is_attached() {
                return Err(LinkError::invalid_config(format!(
                    "endpoint {} ({}) is already in use by link {}",
                    config.path,
                    config.mode,
                    handle.id()
                )));
            }
        }
        Ok(())
    }

    /// Detach a link and drop it from the registry.
    pub async fn detach(&self, id: &str) -> Result<(), LinkError> {
        let handle = self.get(id).await?;
        handle.detach().await;
        let mut links = self.links.write().await;
        links.remove(id);
        log::info!("[fakewire] detached link {id}");
        Ok(())
    }

    /// Detach every link. Returns the IDs that were detached.
    pub async fn detach_all(&self) -> Vec<String> {
        let ids: Vec<String> = {
            let links = self.links.read().await;
            links.keys().cloned().collect()
        };
        for id in &ids {
            let _ = self.detach(id).await;
        }
        ids
    }

    /// Look up a link handle by ID.
    pub async fn get(&self, id: &str) -> Result<Arc<LinkHandle>, LinkError> {
        let links = self.links.read().await;
        links.get(id).cloned().ok_or_else(|| LinkError::link_not_found(id))
    }

    /// Info snapshots for every registered link.
    pub async fn list(&self) -> Vec<LinkInfo> {
        let handles: Vec<Arc<LinkHandle>> = {
            let links = self.links.read().await;
            links.values().cloned().collect()
        };
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    // ── Packet I/O ────────────────────────────────────────────────

    /// Receive one packet on the given link. Same contract as
    /// [`LinkHandle::read_packet`].
    pub async fn read_packet(&self, id: &str, buf: &mut [u8]) -> Result<usize, LinkError> {
        let handle = self.get(id).await?;
        handle.read_packet(buf).await
    }

    /// Transmit one packet on the given link.
    pub async fn write_packet(&self, id: &str, data: &[u8]) -> Result<(), LinkError> {
        let handle = self.get(id).await?;
        handle.write_packet(data).await
    }

    /// Counters for the given link.
    pub async fn stats(&self, id: &str) -> Result<LinkStats, LinkError> {
        let handle = self.get(id).await?;
        handle.stats().await
    }
}
