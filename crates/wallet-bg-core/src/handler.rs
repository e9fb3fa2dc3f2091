use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::connection::{ChainConnection, ConnectionConfig};
use crate::domain::{ChainFamily, ChainIdentity, ChainSlug, ChainSpec, ConnectionStatus, Endpoint};
use crate::ports::{ChainRegistryPort, PortError, RpcTransport};
use crate::rpc::{parse_b256, parse_hex_u64};

/// Recovery rounds attempted for a connection that never became ready.
pub const API_MAX_RETRY: u32 = 2;

pub type StatusCallback = Arc<dyn Fn(&ChainSlug, ConnectionStatus) + Send + Sync>;

#[derive(Clone, Default)]
pub struct InitOptions {
    pub on_status: Option<StatusCallback>,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub connection: ConnectionConfig,
    pub recover_delay: Duration,
    pub max_recover_rounds: u32,
}

impl HandlerConfig {
    pub fn for_family(family: ChainFamily) -> Self {
        Self {
            connection: ConnectionConfig::for_family(family),
            recover_delay: Duration::from_millis(crate::connection::API_AUTO_CONNECT_MS),
            max_recover_rounds: API_MAX_RETRY,
        }
    }
}

/// Owns the connections of one chain family, keyed by chain slug.
#[derive(Clone)]
pub struct ChainHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    family: ChainFamily,
    transport: Arc<dyn RpcTransport>,
    registry: Arc<dyn ChainRegistryPort>,
    config: HandlerConfig,
    connections: RwLock<HashMap<ChainSlug, Managed>>,
    sleeping: AtomicBool,
}

struct Managed {
    connection: ChainConnection,
    relay: JoinHandle<()>,
    last_status: ConnectionStatus,
    recover_rounds: u32,
}

impl ChainHandler {
    pub fn new(
        family: ChainFamily,
        transport: Arc<dyn RpcTransport>,
        registry: Arc<dyn ChainRegistryPort>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                family,
                transport,
                registry,
                config,
                connections: RwLock::new(HashMap::new()),
                sleeping: AtomicBool::new(false),
            }),
        }
    }

    pub fn family(&self) -> ChainFamily {
        self.inner.family
    }

    pub fn is_sleeping(&self) -> bool {
        self.inner.sleeping.load(Ordering::SeqCst)
    }

    /// Creates (or reuses) the connection for `slug` and starts connecting.
    /// Returns without waiting for the handshake.
    pub fn init_api(
        &self,
        slug: &ChainSlug,
        endpoint: Endpoint,
        options: InitOptions,
    ) -> Result<ChainConnection, PortError> {
        if &endpoint.chain != slug {
            return Err(PortError::Validation(format!(
                "endpoint belongs to {}, not {slug}",
                endpoint.chain
            )));
        }

        let mut connections = self.write();
        if let Some(existing) = connections.get(slug) {
            let connection = existing.connection.clone();
            drop(connections);
            if connection.endpoint().url == endpoint.url {
                connection.connect();
            } else {
                let switching = connection.clone();
                tokio::spawn(async move {
                    let slug = switching.slug().clone();
                    if let Err(e) = switching.update_endpoint(endpoint.url).await {
                        tracing::warn!(chain = %slug, error = %e, "provider switch failed");
                    }
                });
            }
            return Ok(connection);
        }

        let connection = ChainConnection::new(
            endpoint,
            self.inner.family,
            Arc::clone(&self.inner.transport),
            self.inner.config.connection.clone(),
        );
        let relay = self.spawn_relay(&connection, options);
        connections.insert(
            slug.clone(),
            Managed {
                connection: connection.clone(),
                relay,
                last_status: ConnectionStatus::Disconnected,
                recover_rounds: 0,
            },
        );
        drop(connections);
        tracing::info!(chain = %slug, family = %self.inner.family, "chain api initialised");
        connection.connect();
        Ok(connection)
    }

    pub fn get_api(&self, slug: &ChainSlug) -> Option<ChainConnection> {
        self.read().get(slug).map(|m| m.connection.clone())
    }

    pub fn api_map(&self) -> HashMap<ChainSlug, ChainConnection> {
        self.read()
            .iter()
            .map(|(slug, m)| (slug.clone(), m.connection.clone()))
            .collect()
    }

    /// Latest status seen by the relay for `slug`.
    pub fn connection_status(&self, slug: &ChainSlug) -> Option<ConnectionStatus> {
        self.read().get(slug).map(|m| m.last_status)
    }

    /// Bookkeeping for one status transition. Schedules a delayed recovery
    /// for connections whose handshake failed and that were never ready.
    pub fn handle_connection(&self, slug: &ChainSlug, status: ConnectionStatus) {
        let mut connections = self.write();
        let Some(managed) = connections.get_mut(slug) else {
            return;
        };
        managed.last_status = status;
        match status {
            ConnectionStatus::Connected => {
                managed.recover_rounds = 0;
                managed.connection.cancel_recovery();
            }
            ConnectionStatus::Error => {
                if self.is_sleeping() || managed.connection.is_api_ready_once() {
                    return;
                }
                if managed.recover_rounds >= self.inner.config.max_recover_rounds {
                    tracing::warn!(chain = %slug, "recovery rounds exhausted");
                    return;
                }
                let factor = 2u32.checked_pow(managed.recover_rounds).unwrap_or(u32::MAX);
                let delay = self.inner.config.recover_delay.saturating_mul(factor);
                managed.recover_rounds += 1;
                tracing::info!(
                    chain = %slug,
                    round = managed.recover_rounds,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling recovery"
                );
                let weak = Arc::downgrade(&self.inner);
                let slug = slug.clone();
                managed.connection.schedule_recovery(delay, async move {
                    if let Some(inner) = weak.upgrade() {
                        let handler = ChainHandler { inner };
                        if let Err(e) = handler.recover_api(&slug).await {
                            tracing::warn!(chain = %slug, error = %e, "recovery failed");
                        }
                    }
                });
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {}
        }
    }

    pub async fn recover_api(&self, slug: &ChainSlug) -> Result<(), PortError> {
        let connection = self
            .get_api(slug)
            .ok_or_else(|| PortError::NotFound(format!("no api for {slug}")))?;
        if connection.is_api_ready_once() {
            return Ok(());
        }
        connection.recover_connect().await
    }

    /// Cancels recoveries and disconnects every connection. A failing
    /// disconnect is logged and does not stop the others.
    pub async fn sleep(&self) {
        self.inner.sleeping.store(true, Ordering::SeqCst);
        let connections: Vec<ChainConnection> = self.api_map().into_values().collect();
        for connection in &connections {
            connection.cancel_recovery();
        }
        let results = futures::future::join_all(connections.iter().map(|connection| async move {
            (connection.slug().clone(), connection.disconnect().await)
        }))
        .await;
        for (slug, result) in results {
            if let Err(e) = result {
                tracing::warn!(chain = %slug, error = %e, "disconnect during sleep failed");
            }
        }
        tracing::info!(family = %self.inner.family, count = connections.len(), "chain apis asleep");
    }

    /// Reconnects every chain the registry marks active.
    pub fn wake_up(&self) {
        self.inner.sleeping.store(false, Ordering::SeqCst);
        let mut woken = 0usize;
        for slug in self.inner.registry.active_chains() {
            let connection = {
                let mut connections = self.write();
                connections.get_mut(&slug).map(|managed| {
                    managed.recover_rounds = 0;
                    managed.connection.clone()
                })
            };
            if let Some(connection) = connection {
                connection.connect();
                woken += 1;
            }
        }
        tracing::info!(family = %self.inner.family, count = woken, "chain apis woken");
    }

    pub async fn destroy_api(&self, slug: &ChainSlug) -> Result<(), PortError> {
        let managed = self.write().remove(slug);
        match managed {
            Some(managed) => {
                managed.relay.abort();
                managed.connection.disconnect().await
            }
            None => Ok(()),
        }
    }

    /// Reads chain properties through the live connection. Failures are
    /// returned to the caller and never touch the connection state.
    pub async fn get_chain_spec(&self, slug: &ChainSlug) -> Result<ChainSpec, PortError> {
        let connection = self
            .get_api(slug)
            .ok_or_else(|| PortError::NotFound(format!("no api for {slug}")))?;
        let info = self.inner.registry.chain_info(slug);
        match self.inner.family {
            ChainFamily::Substrate => {
                let genesis = connection.request("chain_getBlockHash", json!([0])).await?;
                let name = connection.request("system_chain", json!([])).await?;
                let properties = connection.request("system_properties", json!([])).await?;
                Ok(ChainSpec {
                    name: name.as_str().unwrap_or_default().to_owned(),
                    genesis_hash: Some(parse_b256(&genesis)?),
                    evm_chain_id: None,
                    symbol: first_of(&properties, "tokenSymbol")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned(),
                    decimals: first_of(&properties, "tokenDecimals")
                        .and_then(Value::as_u64)
                        .and_then(|d| u8::try_from(d).ok())
                        .unwrap_or_default(),
                    address_prefix: properties
                        .get("ss58Format")
                        .and_then(Value::as_u64)
                        .and_then(|p| u16::try_from(p).ok()),
                })
            }
            ChainFamily::Evm => {
                let chain_id = connection.request("eth_chainId", json!([])).await?;
                let chain_id = parse_hex_u64(&chain_id)?;
                let (name, symbol, decimals) = match info {
                    Some(info) => (info.name, info.symbol, info.decimals),
                    None => (String::new(), String::new(), 18),
                };
                Ok(ChainSpec {
                    name,
                    genesis_hash: None,
                    evm_chain_id: Some(chain_id),
                    symbol,
                    decimals,
                    address_prefix: None,
                })
            }
        }
    }

    /// Expected identity for `slug`, from the registry.
    pub fn expected_identity(&self, slug: &ChainSlug) -> Option<ChainIdentity> {
        self.inner
            .registry
            .chain_info(slug)
            .and_then(|info| info.identity())
    }

    fn spawn_relay(&self, connection: &ChainConnection, options: InitOptions) -> JoinHandle<()> {
        let weak: Weak<HandlerInner> = Arc::downgrade(&self.inner);
        let slug = connection.slug().clone();
        let mut statuses = connection.subscribe();
        tokio::spawn(async move {
            while let Some(status) = statuses.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                ChainHandler { inner }.handle_connection(&slug, status);
                if let Some(callback) = &options.on_status {
                    callback(&slug, status);
                }
            }
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChainSlug, Managed>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChainSlug, Managed>> {
        self.inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// `system_properties` reports scalars or arrays depending on the runtime.
fn first_of<'a>(properties: &'a Value, key: &str) -> Option<&'a Value> {
    match properties.get(key)? {
        Value::Array(items) => items.first(),
        other => Some(other),
    }
}
