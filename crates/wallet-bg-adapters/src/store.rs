use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use alloy::primitives::B256;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use wallet_bg_core::{AuthStorePort, AuthUrls, MetadataDef, MetadataStorePort, PortError};

const AUTH_FILE: &str = "auth_urls.json";
const METADATA_FILE: &str = "metadata.json";

/// Auth records and metadata definitions kept as JSON files in one directory.
/// Clones share the same write lock.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Arc<AsyncMutex<()>>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, file: &str) -> Result<T, PortError> {
        let path = self.dir.join(file);
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                PortError::Validation(format!("{} decode failed: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(PortError::Transport(format!(
                "{} read failed: {e}",
                path.display()
            ))),
        }
    }

    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<(), PortError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| PortError::Validation(format!("{file} encode failed: {e}")))?;
        write_atomic(&self.dir.join(file), &bytes).await
    }

    async fn metadata_map(&self) -> Result<BTreeMap<String, MetadataDef>, PortError> {
        self.read_json(METADATA_FILE).await
    }
}

#[async_trait]
impl AuthStorePort for JsonFileStore {
    async fn load(&self) -> Result<AuthUrls, PortError> {
        self.read_json(AUTH_FILE).await
    }

    async fn save(&self, urls: &AuthUrls) -> Result<(), PortError> {
        let _guard = self.write_lock.lock().await;
        self.write_json(AUTH_FILE, urls).await?;
        tracing::debug!(entries = urls.len(), "auth urls saved");
        Ok(())
    }
}

#[async_trait]
impl MetadataStorePort for JsonFileStore {
    async fn get(&self, genesis_hash: &B256) -> Result<Option<MetadataDef>, PortError> {
        Ok(self.metadata_map().await?.remove(&metadata_key(genesis_hash)))
    }

    async fn put(&self, def: &MetadataDef) -> Result<(), PortError> {
        let _guard = self.write_lock.lock().await;
        let mut defs = self.metadata_map().await?;
        defs.insert(metadata_key(&def.genesis_hash), def.clone());
        self.write_json(METADATA_FILE, &defs).await?;
        tracing::debug!(
            chain = %def.chain,
            spec_version = def.spec_version,
            "metadata saved"
        );
        Ok(())
    }

    async fn all(&self) -> Result<Vec<MetadataDef>, PortError> {
        Ok(self.metadata_map().await?.into_values().collect())
    }
}

fn metadata_key(genesis_hash: &B256) -> String {
    alloy::hex::encode_prefixed(genesis_hash)
}

/// Writes to a sibling temp file, then renames over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PortError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            PortError::Transport(format!("{} mkdir failed: {e}", parent.display()))
        })?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| PortError::Transport(format!("{} write failed: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PortError::Transport(format!("{} rename failed: {e}", path.display())))
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    auth: Mutex<AuthUrls>,
    metadata: Mutex<BTreeMap<B256, MetadataDef>>,
}

impl MemoryStore {
    fn auth(&self) -> Result<std::sync::MutexGuard<'_, AuthUrls>, PortError> {
        self.auth
            .lock()
            .map_err(|e| PortError::Transport(format!("auth store lock poisoned: {e}")))
    }

    fn metadata(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<B256, MetadataDef>>, PortError> {
        self.metadata
            .lock()
            .map_err(|e| PortError::Transport(format!("metadata store lock poisoned: {e}")))
    }
}

#[async_trait]
impl AuthStorePort for MemoryStore {
    async fn load(&self) -> Result<AuthUrls, PortError> {
        Ok(self.auth()?.clone())
    }

    async fn save(&self, urls: &AuthUrls) -> Result<(), PortError> {
        *self.auth()? = urls.clone();
        Ok(())
    }
}

#[async_trait]
impl MetadataStorePort for MemoryStore {
    async fn get(&self, genesis_hash: &B256) -> Result<Option<MetadataDef>, PortError> {
        Ok(self.metadata()?.get(genesis_hash).cloned())
    }

    async fn put(&self, def: &MetadataDef) -> Result<(), PortError> {
        self.metadata()?.insert(def.genesis_hash, def.clone());
        Ok(())
    }

    async fn all(&self) -> Result<Vec<MetadataDef>, PortError> {
        Ok(self.metadata()?.values().cloned().collect())
    }
}
