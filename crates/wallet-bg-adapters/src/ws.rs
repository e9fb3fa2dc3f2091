//! Substrate JSON-RPC over WebSocket.
//!
//! Each handle owns a driver task that holds the socket. Requests travel to
//! the driver over a channel and their replies come back through a oneshot
//! keyed by JSON-RPC id. When the socket drops the driver fails every
//! in-flight request, reports `Disconnected`, and keeps redialing the same
//! URL every `reconnect_delay` until it succeeds (`Connected`) or the handle
//! is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wallet_bg_core::rpc::{parse_b256, parse_response, request_body};
use wallet_bg_core::{
    ChainFamily, ChainIdentity, Endpoint, HandleSignal, PortError, RpcHandle, RpcTransport,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = oneshot::Sender<Result<Value, PortError>>;

#[derive(Debug, Clone)]
pub struct SubstrateWsTransport {
    reconnect_delay: Duration,
    request_timeout: Duration,
}

impl SubstrateWsTransport {
    pub fn new(reconnect_delay: Duration, request_timeout: Duration) -> Self {
        Self {
            reconnect_delay,
            request_timeout,
        }
    }
}

#[async_trait]
impl RpcTransport for SubstrateWsTransport {
    fn family(&self) -> ChainFamily {
        ChainFamily::Substrate
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcHandle>, PortError> {
        let url = url::Url::parse(&endpoint.url)
            .map_err(|e| PortError::Validation(format!("invalid provider url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PortError::Validation(format!(
                "unsupported scheme for substrate provider: {}",
                url.scheme()
            )));
        }
        let (ws, _response) = tokio_tungstenite::connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| PortError::Transport(format!("websocket connect failed: {e}")))?;
        tracing::debug!(chain = %endpoint.chain, url = %endpoint.url, "websocket opened");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(
            endpoint.clone(),
            ws,
            command_rx,
            signal_tx,
            self.reconnect_delay,
        ));
        Ok(Arc::new(WsHandle {
            endpoint: endpoint.clone(),
            commands: command_tx,
            signals: Mutex::new(Some(signal_rx)),
            driver: AsyncMutex::new(Some(driver)),
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
        }))
    }
}

enum Command {
    Request { id: u64, body: String, reply: Reply },
    Close,
}

pub struct WsHandle {
    endpoint: Endpoint,
    commands: mpsc::UnboundedSender<Command>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<HandleSignal>>>,
    driver: AsyncMutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

#[async_trait]
impl RpcHandle for WsHandle {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<HandleSignal>> {
        self.signals.lock().ok()?.take()
    }

    async fn handshake(&self) -> Result<ChainIdentity, PortError> {
        let genesis = self.request("chain_getBlockHash", json!([0])).await?;
        Ok(ChainIdentity::Genesis(parse_b256(&genesis)?))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, PortError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = request_body(id, method, params).to_string();
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Command::Request { id, body, reply })
            .map_err(|_| {
                PortError::Transport(format!("connection to {} is closed", self.endpoint.url))
            })?;
        match tokio::time::timeout(self.request_timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PortError::Transport(format!(
                "{method} dropped by {}",
                self.endpoint.url
            ))),
            Err(_) => Err(PortError::Timeout(format!(
                "{method} on {}",
                self.endpoint.url
            ))),
        }
    }

    async fn disconnect(&self) -> Result<(), PortError> {
        let Some(driver) = self.driver.lock().await.take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Close);
        driver
            .await
            .map_err(|e| PortError::Transport(format!("websocket driver failed: {e}")))
    }
}

enum Exit {
    Closed,
    Lost(String),
}

async fn drive(
    endpoint: Endpoint,
    mut ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedSender<HandleSignal>,
    reconnect_delay: Duration,
) {
    let mut pending: HashMap<u64, Reply> = HashMap::new();
    loop {
        let exit = serve(&mut ws, &mut commands, &mut pending).await;
        match exit {
            Exit::Closed => {
                fail_all(&mut pending, "connection closed");
                if let Err(e) = ws.close(None).await {
                    tracing::debug!(url = %endpoint.url, error = %e, "websocket close failed");
                }
                tracing::debug!(url = %endpoint.url, "websocket closed");
                return;
            }
            Exit::Lost(reason) => {
                fail_all(&mut pending, &reason);
                tracing::info!(
                    chain = %endpoint.chain,
                    url = %endpoint.url,
                    reason = %reason,
                    "websocket dropped"
                );
                let _ = signals.send(HandleSignal::Disconnected);
                match redial(&endpoint, &mut commands, &signals, reconnect_delay).await {
                    Some(fresh) => ws = fresh,
                    None => return,
                }
            }
        }
    }
}

async fn serve(
    ws: &mut WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    pending: &mut HashMap<u64, Reply>,
) -> Exit {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Request { id, body, reply }) => {
                    if let Err(e) = ws.send(Message::Text(body.into())).await {
                        let reason = format!("send failed: {e}");
                        let _ = reply.send(Err(PortError::Transport(reason.clone())));
                        return Exit::Lost(reason);
                    }
                    pending.retain(|_, waiting| !waiting.is_closed());
                    pending.insert(id, reply);
                }
                Some(Command::Close) | None => return Exit::Closed,
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(pending, text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    return Exit::Lost("closed by peer".to_owned())
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Exit::Lost(e.to_string()),
            },
        }
    }
}

/// Waits out the delay and dials again until it works. Requests made in
/// the meantime fail fast. `None` means the handle was closed.
async fn redial(
    endpoint: &Endpoint,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    signals: &mpsc::UnboundedSender<HandleSignal>,
    delay: Duration,
) -> Option<WsStream> {
    loop {
        let pause = tokio::time::sleep(delay);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => break,
                command = commands.recv() => match command {
                    Some(Command::Request { reply, .. }) => {
                        let _ = reply.send(Err(PortError::Transport("reconnecting".to_owned())));
                    }
                    Some(Command::Close) | None => return None,
                },
            }
        }
        match tokio_tungstenite::connect_async(endpoint.url.as_str()).await {
            Ok((ws, _response)) => {
                tracing::info!(
                    chain = %endpoint.chain,
                    url = %endpoint.url,
                    "websocket reconnected"
                );
                let _ = signals.send(HandleSignal::Connected);
                return Some(ws);
            }
            Err(e) => {
                tracing::debug!(url = %endpoint.url, error = %e, "websocket redial failed");
                let _ = signals.send(HandleSignal::Error(format!("redial failed: {e}")));
            }
        }
    }
}

fn dispatch(pending: &mut HashMap<u64, Reply>, text: &str) {
    let envelope: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring non-json frame");
            return;
        }
    };
    let envelopes = match envelope {
        Value::Array(batch) => batch,
        single => vec![single],
    };
    for envelope in envelopes {
        let (id, result) = parse_response(&envelope);
        // Subscription notifications carry no id.
        let Some(id) = id else { continue };
        match pending.remove(&id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => tracing::trace!(id, "reply for unknown request"),
        }
    }
}

fn fail_all(pending: &mut HashMap<u64, Reply>, reason: &str) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(PortError::Transport(reason.to_owned())));
    }
}
