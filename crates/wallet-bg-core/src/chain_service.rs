use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::connection::ChainConnection;
use crate::domain::{ChainFamily, ChainIdentity, ChainSlug, Endpoint};
use crate::handler::{ChainHandler, HandlerConfig, InitOptions};
use crate::ports::{ChainRegistryPort, PortError, RpcTransport};
use crate::probe::{close_handle, probe, ProbeErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainValidationError {
    InvalidProvider,
    ExistedProvider,
    ExistedChain,
    ProviderNotSameChain,
    ConnectionFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidateNetworkResponse {
    pub success: bool,
    pub error: Option<ChainValidationError>,
    pub family: Option<ChainFamily>,
    pub identity: Option<ChainIdentity>,
    pub conflict_chain: Option<ChainSlug>,
    pub probe_error: Option<ProbeErrorKind>,
}

impl ValidateNetworkResponse {
    fn failed(error: ChainValidationError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Both chain handlers plus the registry they serve.
pub struct ChainService {
    registry: Arc<dyn ChainRegistryPort>,
    substrate: ChainHandler,
    evm: ChainHandler,
    substrate_transport: Arc<dyn RpcTransport>,
    evm_transport: Arc<dyn RpcTransport>,
    substrate_budget: Duration,
    evm_budget: Duration,
}

impl ChainService {
    pub fn new(
        registry: Arc<dyn ChainRegistryPort>,
        substrate_transport: Arc<dyn RpcTransport>,
        evm_transport: Arc<dyn RpcTransport>,
        substrate_config: HandlerConfig,
        evm_config: HandlerConfig,
    ) -> Self {
        let substrate_budget = substrate_config.connection.connect_timeout;
        let evm_budget = evm_config.connection.connect_timeout;
        Self {
            substrate: ChainHandler::new(
                ChainFamily::Substrate,
                Arc::clone(&substrate_transport),
                Arc::clone(&registry),
                substrate_config,
            ),
            evm: ChainHandler::new(
                ChainFamily::Evm,
                Arc::clone(&evm_transport),
                Arc::clone(&registry),
                evm_config,
            ),
            registry,
            substrate_transport,
            evm_transport,
            substrate_budget,
            evm_budget,
        }
    }

    pub fn handler(&self, family: ChainFamily) -> &ChainHandler {
        match family {
            ChainFamily::Substrate => &self.substrate,
            ChainFamily::Evm => &self.evm,
        }
    }

    pub fn registry(&self) -> &Arc<dyn ChainRegistryPort> {
        &self.registry
    }

    /// Connects `slug` through its first configured provider.
    pub fn init_chain(
        &self,
        slug: &ChainSlug,
        options: InitOptions,
    ) -> Result<ChainConnection, PortError> {
        let info = self
            .registry
            .chain_info(slug)
            .ok_or_else(|| PortError::NotFound(format!("unknown chain {slug}")))?;
        let endpoint = info
            .default_endpoint()
            .ok_or_else(|| PortError::Validation(format!("chain {slug} has no providers")))?;
        self.handler(info.family).init_api(slug, endpoint, options)
    }

    /// Initialises every active chain. Chains that fail are logged and skipped.
    pub fn init_active_chains(&self, options: InitOptions) -> Vec<ChainConnection> {
        self.registry
            .active_chains()
            .iter()
            .filter_map(|slug| match self.init_chain(slug, options.clone()) {
                Ok(connection) => Some(connection),
                Err(e) => {
                    tracing::warn!(chain = %slug, error = %e, "chain init failed");
                    None
                }
            })
            .collect()
    }

    pub async fn stop_all_chain_apis(&self) {
        futures::join!(self.substrate.sleep(), self.evm.sleep());
    }

    pub fn resume_all_chain_apis(&self) {
        self.substrate.wake_up();
        self.evm.wake_up();
    }

    pub async fn refresh_api(&self, slug: &ChainSlug) {
        let Some(info) = self.registry.chain_info(slug) else {
            tracing::warn!(chain = %slug, "refresh of unknown chain");
            return;
        };
        if let Err(e) = self.handler(info.family).recover_api(slug).await {
            tracing::warn!(chain = %slug, error = %e, "refresh failed");
        }
    }

    /// Checks that `url` is a new, reachable provider and, when `existing` is
    /// given, that it serves that chain. The probe connection is closed
    /// before returning.
    pub async fn validate_custom_chain(
        &self,
        url: &str,
        existing: Option<&ChainSlug>,
    ) -> Result<ValidateNetworkResponse, PortError> {
        let Some(family) = ChainFamily::from_url(url) else {
            return Ok(ValidateNetworkResponse::failed(
                ChainValidationError::InvalidProvider,
            ));
        };
        let chains = self.registry.all_chains();
        if let Some(owner) = chains.iter().find(|info| info.has_provider_url(url)) {
            return Ok(ValidateNetworkResponse {
                conflict_chain: Some(owner.slug.clone()),
                family: Some(family),
                ..ValidateNetworkResponse::failed(ChainValidationError::ExistedProvider)
            });
        }

        let slug = match existing {
            Some(slug) => slug.clone(),
            None => ChainSlug::new("custom")?,
        };
        let (transport, budget) = match family {
            ChainFamily::Substrate => (&self.substrate_transport, self.substrate_budget),
            ChainFamily::Evm => (&self.evm_transport, self.evm_budget),
        };
        let endpoint = Endpoint::new(slug, "custom", url);
        let result = probe(transport.as_ref(), &endpoint, None, budget).await;
        if let Some(handle) = &result.handle {
            close_handle(handle.as_ref()).await;
        }
        let identity = match (result.connected, result.identity) {
            (true, Some(identity)) => identity,
            _ => {
                return Ok(ValidateNetworkResponse {
                    family: Some(family),
                    probe_error: result.error_kind,
                    ..ValidateNetworkResponse::failed(ChainValidationError::ConnectionFailure)
                })
            }
        };

        let base = ValidateNetworkResponse {
            family: Some(family),
            identity: Some(identity),
            ..ValidateNetworkResponse::default()
        };
        match existing {
            Some(slug) => {
                let expected = chains
                    .iter()
                    .find(|info| &info.slug == slug)
                    .and_then(|info| info.identity());
                if expected.is_some_and(|expected| expected != identity) {
                    return Ok(ValidateNetworkResponse {
                        error: Some(ChainValidationError::ProviderNotSameChain),
                        conflict_chain: Some(slug.clone()),
                        ..base
                    });
                }
            }
            None => {
                if let Some(owner) = chains
                    .iter()
                    .find(|info| info.identity() == Some(identity))
                {
                    return Ok(ValidateNetworkResponse {
                        error: Some(ChainValidationError::ExistedChain),
                        conflict_chain: Some(owner.slug.clone()),
                        ..base
                    });
                }
            }
        }
        Ok(ValidateNetworkResponse {
            success: true,
            ..base
        })
    }
}
