use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};

use crate::completion::{completion, Completion};
use crate::domain::{ChainFamily, ChainIdentity, Endpoint};
use crate::ports::{HandleSignal, PortError, RpcHandle, RpcTransport};

pub const SUBSTRATE_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const EVM_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

pub fn default_probe_timeout(family: ChainFamily) -> Duration {
    match family {
        ChainFamily::Substrate => SUBSTRATE_PROBE_TIMEOUT,
        ChainFamily::Evm => EVM_PROBE_TIMEOUT,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    Timeout,
    Transport,
    WrongIdentity,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::WrongIdentity => "wrong_identity",
        }
    }

    fn of(error: &PortError) -> Self {
        match error {
            PortError::Timeout(_) => Self::Timeout,
            PortError::WrongIdentity { .. } => Self::WrongIdentity,
            _ => Self::Transport,
        }
    }
}

pub(crate) type ProbeOutcome = Result<ChainIdentity, PortError>;

pub struct ProbeResult {
    pub connected: bool,
    /// Present only when `connected`; the caller owns it from here on.
    pub handle: Option<Arc<dyn RpcHandle>>,
    /// Remaining signal stream of `handle`, for the caller's own watcher.
    pub signals: Option<mpsc::UnboundedReceiver<HandleSignal>>,
    pub identity: Option<ChainIdentity>,
    pub error_kind: Option<ProbeErrorKind>,
    pub error: Option<String>,
}

impl fmt::Debug for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeResult")
            .field("connected", &self.connected)
            .field("has_handle", &self.handle.is_some())
            .field("identity", &self.identity)
            .field("error_kind", &self.error_kind)
            .field("error", &self.error)
            .finish()
    }
}

impl ProbeResult {
    fn failed(kind: ProbeErrorKind, identity: Option<ChainIdentity>, error: String) -> Self {
        Self {
            connected: false,
            handle: None,
            signals: None,
            identity,
            error_kind: Some(kind),
            error: Some(error),
        }
    }
}

/// Opens one connection to `endpoint` and checks it answers within `budget`,
/// optionally against an expected chain identity. Every exit path except a
/// verified success closes the handle it opened.
pub async fn probe(
    transport: &dyn RpcTransport,
    endpoint: &Endpoint,
    expected: Option<ChainIdentity>,
    budget: Duration,
) -> ProbeResult {
    let (decided, settled) = completion();
    probe_until(transport, endpoint, expected, budget, decided, settled).await
}

/// Same as [`probe`], with the settle-once cell supplied by the caller so
/// another party can decide the outcome early (cancellation).
pub(crate) async fn probe_until(
    transport: &dyn RpcTransport,
    endpoint: &Endpoint,
    expected: Option<ChainIdentity>,
    budget: Duration,
    decided: Completion<ProbeOutcome>,
    mut settled: oneshot::Receiver<ProbeOutcome>,
) -> ProbeResult {
    let deadline = Instant::now() + budget;

    let opened = tokio::select! {
        opened = timeout_at(deadline, transport.open(endpoint)) => opened,
        early = &mut settled => {
            let error = match early {
                Ok(Err(e)) => e,
                _ => PortError::Conflict("probe decided before open".to_owned()),
            };
            return report(endpoint, ProbeResult::failed(ProbeErrorKind::of(&error), None, error.to_string()));
        }
    };
    let handle = match opened {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            decided.settle(Err(PortError::Transport(e.to_string())));
            return report(
                endpoint,
                ProbeResult::failed(ProbeErrorKind::of(&e), None, e.to_string()),
            );
        }
        Err(_) => {
            decided.settle(Err(PortError::Timeout("open".to_owned())));
            return report(
                endpoint,
                ProbeResult::failed(
                    ProbeErrorKind::Timeout,
                    None,
                    format!("no connection within {budget:?}"),
                ),
            );
        }
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    let listener = handle
        .take_signals()
        .map(|signals| tokio::spawn(watch_signals(signals, decided.clone(), stop_rx)));

    let handshake = {
        let handle = Arc::clone(&handle);
        let decided = decided.clone();
        tokio::spawn(async move {
            decided.settle(handle.handshake().await);
        })
    };

    let outcome = match timeout_at(deadline, &mut settled).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(PortError::Transport("probe outcome dropped".to_owned())),
        Err(_) => {
            decided.settle(Err(PortError::Timeout(format!(
                "no handshake within {budget:?}"
            ))));
            settled
                .await
                .unwrap_or_else(|_| Err(PortError::Transport("probe outcome dropped".to_owned())))
        }
    };

    handshake.abort();
    let _ = stop_tx.send(());
    let signals = match listener {
        Some(task) => task.await.ok().flatten(),
        None => None,
    };

    let result = match outcome {
        Ok(identity) => match expected {
            Some(expected) if expected != identity => {
                close_handle(handle.as_ref()).await;
                let error = PortError::WrongIdentity {
                    expected,
                    actual: identity,
                };
                ProbeResult::failed(
                    ProbeErrorKind::WrongIdentity,
                    Some(identity),
                    error.to_string(),
                )
            }
            _ => ProbeResult {
                connected: true,
                handle: Some(handle),
                signals,
                identity: Some(identity),
                error_kind: None,
                error: None,
            },
        },
        Err(e) => {
            close_handle(handle.as_ref()).await;
            ProbeResult::failed(ProbeErrorKind::of(&e), None, e.to_string())
        }
    };
    report(endpoint, result)
}

async fn watch_signals(
    mut signals: mpsc::UnboundedReceiver<HandleSignal>,
    decided: Completion<ProbeOutcome>,
    mut stop: oneshot::Receiver<()>,
) -> Option<mpsc::UnboundedReceiver<HandleSignal>> {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => return Some(signals),
            signal = signals.recv() => match signal {
                Some(HandleSignal::Connected) => {}
                Some(HandleSignal::Disconnected) => {
                    decided.settle(Err(PortError::Transport(
                        "disconnected before handshake".to_owned(),
                    )));
                    return None;
                }
                Some(HandleSignal::Error(message)) => {
                    decided.settle(Err(PortError::Transport(message)));
                    return None;
                }
                None => return None,
            },
        }
    }
}

fn report(endpoint: &Endpoint, result: ProbeResult) -> ProbeResult {
    match result.error_kind {
        None => tracing::info!(
            chain = %endpoint.chain,
            url = %endpoint.url,
            probe.outcome = "connected",
            "provider probe succeeded"
        ),
        Some(kind) => tracing::warn!(
            chain = %endpoint.chain,
            url = %endpoint.url,
            probe.outcome = kind.as_str(),
            error = result.error.as_deref().unwrap_or_default(),
            "provider probe failed"
        ),
    }
    result
}

pub(crate) async fn close_handle(handle: &dyn RpcHandle) {
    if let Err(e) = handle.disconnect().await {
        tracing::warn!(
            chain = %handle.endpoint().chain,
            url = %handle.endpoint().url,
            error = %e,
            "failed to close connection handle"
        );
    }
}
