use std::path::Path;
use std::sync::RwLock;

use wallet_bg_core::{ChainInfo, ChainRegistryPort, ChainSlug, PortError};

/// Chain list loaded once from JSON. Order of the file is kept so the
/// active chains come up in the order they were listed.
#[derive(Debug, Default)]
pub struct StaticChainRegistry {
    chains: RwLock<Vec<ChainInfo>>,
}

impl StaticChainRegistry {
    pub fn new(chains: Vec<ChainInfo>) -> Result<Self, PortError> {
        let registry = Self::default();
        for info in chains {
            registry.upsert(info)?;
        }
        Ok(registry)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PortError> {
        let chains: Vec<ChainInfo> = serde_json::from_str(raw)
            .map_err(|e| PortError::Validation(format!("chain list decode failed: {e}")))?;
        Self::new(chains)
    }

    pub async fn from_path(path: &Path) -> Result<Self, PortError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PortError::NotFound(format!("{}: {e}", path.display())))?;
        let registry = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            chains = registry.len(),
            "chain list loaded"
        );
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.read().map(|chains| chains.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a chain, or replaces the one with the same slug in place.
    /// A provider URL may belong to one chain only.
    pub fn upsert(&self, info: ChainInfo) -> Result<(), PortError> {
        let mut chains = self.write()?;
        for url in info.providers.values() {
            if let Some(owner) = chains
                .iter()
                .find(|c| c.slug != info.slug && c.has_provider_url(url))
            {
                return Err(PortError::Conflict(format!(
                    "provider {url} already belongs to {}",
                    owner.slug
                )));
            }
        }
        match chains.iter_mut().find(|c| c.slug == info.slug) {
            Some(existing) => *existing = info,
            None => chains.push(info),
        }
        Ok(())
    }

    pub fn set_active(&self, slug: &ChainSlug, active: bool) -> Result<(), PortError> {
        let mut chains = self.write()?;
        let info = chains
            .iter_mut()
            .find(|c| &c.slug == slug)
            .ok_or_else(|| PortError::NotFound(format!("unknown chain {slug}")))?;
        info.active = active;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<ChainInfo>>, PortError> {
        self.chains
            .read()
            .map_err(|e| PortError::Transport(format!("chain registry lock poisoned: {e}")))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<ChainInfo>>, PortError> {
        self.chains
            .write()
            .map_err(|e| PortError::Transport(format!("chain registry lock poisoned: {e}")))
    }
}

impl ChainRegistryPort for StaticChainRegistry {
    fn chain_info(&self, slug: &ChainSlug) -> Option<ChainInfo> {
        self.read()
            .ok()?
            .iter()
            .find(|c| &c.slug == slug)
            .cloned()
    }

    fn all_chains(&self) -> Vec<ChainInfo> {
        self.read()
            .map(|chains| chains.clone())
            .unwrap_or_default()
    }

    fn active_chains(&self) -> Vec<ChainSlug> {
        self.read()
            .map(|chains| {
                chains
                    .iter()
                    .filter(|c| c.active)
                    .map(|c| c.slug.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
