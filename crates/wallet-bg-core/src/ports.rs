use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{
    AuthUrls, ChainFamily, ChainIdentity, ChainInfo, ChainSlug, DerivationIndices, Endpoint,
    EvmConfirmationType, MetadataDef, NotificationMode, WindowId,
};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("wrong chain identity: expected {expected}, got {actual}")]
    WrongIdentity {
        expected: ChainIdentity,
        actual: ChainIdentity,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("policy violation: {0}")]
    Policy(String),
}

/// Out-of-band events a live handle reports about its underlying transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleSignal {
    Connected,
    Disconnected,
    Error(String),
}

/// One open connection to one RPC endpoint.
#[async_trait]
pub trait RpcHandle: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    /// Hands out the signal stream. Only the first caller gets it.
    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<HandleSignal>>;

    /// Liveness + identity check (genesis hash or chain id).
    async fn handshake(&self) -> Result<ChainIdentity, PortError>;

    async fn request(&self, method: &str, params: Value) -> Result<Value, PortError>;

    async fn disconnect(&self) -> Result<(), PortError>;
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    fn family(&self) -> ChainFamily;

    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcHandle>, PortError>;
}

pub trait ChainRegistryPort: Send + Sync {
    fn chain_info(&self, slug: &ChainSlug) -> Option<ChainInfo>;
    fn all_chains(&self) -> Vec<ChainInfo>;
    fn active_chains(&self) -> Vec<ChainSlug>;
}

#[async_trait]
pub trait AuthStorePort: Send + Sync {
    async fn load(&self) -> Result<AuthUrls, PortError>;
    async fn save(&self, urls: &AuthUrls) -> Result<(), PortError>;
}

#[async_trait]
pub trait MetadataStorePort: Send + Sync {
    async fn get(&self, genesis_hash: &B256) -> Result<Option<MetadataDef>, PortError>;
    async fn put(&self, def: &MetadataDef) -> Result<(), PortError>;
    async fn all(&self) -> Result<Vec<MetadataDef>, PortError>;
}

#[async_trait]
pub trait ActionBadgePort: Send + Sync {
    /// `0` clears the badge.
    async fn set_badge(&self, pending: usize) -> Result<(), PortError>;
    async fn open_popup_window(&self, mode: NotificationMode) -> Result<WindowId, PortError>;
    async fn close_popup_window(&self, window: WindowId) -> Result<(), PortError>;
}

#[async_trait]
pub trait HardwareSignerPort: Send + Sync {
    async fn sign(
        &self,
        payload: &[u8],
        indices: DerivationIndices,
    ) -> Result<String, PortError>;
}

#[async_trait]
pub trait KeyringSignerPort: Send + Sync {
    async fn sign(&self, account: &str, payload: &[u8]) -> Result<String, PortError>;
}

#[async_trait]
pub trait EvmSignerPort: Send + Sync {
    async fn sign(
        &self,
        confirmation_type: EvmConfirmationType,
        payload: &Value,
    ) -> Result<Value, PortError>;
}

pub trait PasswordGatePort: Send + Sync {
    fn verify(&self, password: &str) -> Result<(), PortError>;
}

pub trait ClockPort: Send + Sync {
    fn now_ms(&self) -> Result<u64, PortError>;
}
