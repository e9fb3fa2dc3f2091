use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use wallet_bg_core::rpc::{parse_hex_u64, parse_response, request_body};
use wallet_bg_core::{
    ChainFamily, ChainIdentity, Endpoint, HandleSignal, PortError, RpcHandle, RpcTransport,
};

/// EVM JSON-RPC over HTTP. One shared client; each opened handle is a
/// stateless view bound to one URL.
#[derive(Debug, Clone)]
pub struct EvmHttpTransport {
    client: reqwest::Client,
}

impl EvmHttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, PortError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PortError::Transport(format!("http client init failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RpcTransport for EvmHttpTransport {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcHandle>, PortError> {
        let url = url::Url::parse(&endpoint.url)
            .map_err(|e| PortError::Validation(format!("invalid provider url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PortError::Validation(format!(
                "unsupported scheme for evm provider: {}",
                url.scheme()
            )));
        }
        Ok(Arc::new(EvmHttpHandle {
            endpoint: endpoint.clone(),
            url,
            client: self.client.clone(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct EvmHttpHandle {
    endpoint: Endpoint,
    url: url::Url,
    client: reqwest::Client,
    next_id: AtomicU64,
    closed: AtomicBool,
}

#[async_trait]
impl RpcHandle for EvmHttpHandle {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    // HTTP has no out-of-band transport events.
    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<HandleSignal>> {
        None
    }

    async fn handshake(&self) -> Result<ChainIdentity, PortError> {
        let chain_id = self.request("eth_chainId", json!([])).await?;
        Ok(ChainIdentity::EvmChainId(parse_hex_u64(&chain_id)?))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, PortError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PortError::Transport(format!(
                "connection to {} is closed",
                self.endpoint.url
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .client
            .post(self.url.as_str())
            .json(&request_body(id, method, params))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PortError::Timeout(format!("{method} on {}", self.endpoint.url))
                } else {
                    PortError::Transport(format!("{method} request failed: {e}"))
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortError::Transport(format!(
                "{method} returned http status {status}"
            )));
        }
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| PortError::Transport(format!("{method} json decode failed: {e}")))?;
        let (reply_id, result) = parse_response(&envelope);
        if reply_id.is_some_and(|reply_id| reply_id != id) {
            return Err(PortError::Validation(format!(
                "{method} answered with id {reply_id:?}, expected {id}"
            )));
        }
        result
    }

    async fn disconnect(&self) -> Result<(), PortError> {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(
            chain = %self.endpoint.chain,
            url = %self.endpoint.url,
            "http handle closed"
        );
        Ok(())
    }
}
