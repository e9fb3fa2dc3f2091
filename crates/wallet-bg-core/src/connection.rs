use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::completion::{completion, Completion};
use crate::domain::{ChainFamily, ChainIdentity, ChainSlug, ConnectionStatus, Endpoint};
use crate::ports::{HandleSignal, PortError, RpcHandle, RpcTransport};
use crate::probe::{close_handle, default_probe_timeout, probe_until, ProbeOutcome, ProbeResult};
use crate::state_machine::{connection_transition, ConnectionAction, ConnectionState};
use crate::status::{StatusChannel, StatusReceiver};

/// Delay between transport-level redials after a drop.
pub const API_AUTO_CONNECT_MS: u64 = 3_000;
/// Consecutive drops tolerated before a once-ready connection is given up.
pub const MAX_CONSECUTIVE_RETRIES: u32 = 9;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub max_consecutive_retries: u32,
}

impl ConnectionConfig {
    pub fn for_family(family: ChainFamily) -> Self {
        Self {
            connect_timeout: default_probe_timeout(family),
            max_consecutive_retries: MAX_CONSECUTIVE_RETRIES,
        }
    }
}

/// One chain's live connection. Owns at most one open handle at a time.
#[derive(Clone)]
pub struct ChainConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ChainConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConnection")
            .field("slug", &self.inner.slug)
            .field("family", &self.inner.family)
            .finish_non_exhaustive()
    }
}

struct ConnectionInner {
    slug: ChainSlug,
    family: ChainFamily,
    transport: Arc<dyn RpcTransport>,
    config: ConnectionConfig,
    endpoint: Mutex<Endpoint>,
    slot: Mutex<Slot>,
    status: StatusChannel<ConnectionStatus>,
    api_ready_once: AtomicBool,
    retries: AtomicU32,
    switch_lock: tokio::sync::Mutex<()>,
}

struct Slot {
    state: ConnectionState,
    generation: u64,
    handle: Option<Arc<dyn RpcHandle>>,
    identity: Option<ChainIdentity>,
    attempt: Option<Attempt>,
    watcher: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
}

struct Attempt {
    decided: Completion<ProbeOutcome>,
    task: JoinHandle<()>,
}

impl ChainConnection {
    pub fn new(
        endpoint: Endpoint,
        family: ChainFamily,
        transport: Arc<dyn RpcTransport>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                slug: endpoint.chain.clone(),
                family,
                transport,
                config,
                endpoint: Mutex::new(endpoint),
                slot: Mutex::new(Slot {
                    state: ConnectionState::Idle,
                    generation: 0,
                    handle: None,
                    identity: None,
                    attempt: None,
                    watcher: None,
                    recovery: None,
                }),
                status: StatusChannel::new(ConnectionStatus::Disconnected),
                api_ready_once: AtomicBool::new(false),
                retries: AtomicU32::new(0),
                switch_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn slug(&self) -> &ChainSlug {
        &self.inner.slug
    }

    pub fn family(&self) -> ChainFamily {
        self.inner.family
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    pub fn subscribe(&self) -> StatusReceiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_api_ready_once(&self) -> bool {
        self.inner.api_ready_once.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Identity reported by the last successful handshake.
    pub fn identity(&self) -> Option<ChainIdentity> {
        self.inner.lock_slot().identity
    }

    pub fn consecutive_retries(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    /// Starts a connection attempt in the background. No-op while connecting
    /// or connected, and while the transport is redialing a dropped handle.
    pub fn connect(&self) {
        let mut slot = self.inner.lock_slot();
        if matches!(
            slot.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        if slot.handle.is_some() {
            tracing::debug!(chain = %self.inner.slug, "transport is redialing, connect skipped");
            return;
        }
        if let Err(e) = self.inner.apply(&mut slot, ConnectionAction::Connect) {
            tracing::warn!(chain = %self.inner.slug, error = %e, "connect refused");
            return;
        }
        slot.generation += 1;
        let generation = slot.generation;
        let (decided, settled) = completion();
        let inner = Arc::clone(&self.inner);
        let attempt_decided = decided.clone();
        let task = tokio::spawn(async move {
            let endpoint = inner.endpoint();
            let result = probe_until(
                inner.transport.as_ref(),
                &endpoint,
                None,
                inner.config.connect_timeout,
                attempt_decided,
                settled,
            )
            .await;
            ConnectionInner::finish_attempt(&inner, generation, endpoint, result).await;
        });
        slot.attempt = Some(Attempt { decided, task });
    }

    /// Closes the live handle and cancels every pending task. Idempotent.
    /// The status is Disconnected even when closing the handle fails.
    pub async fn disconnect(&self) -> Result<(), PortError> {
        let (handle, attempt) = {
            let mut slot = self.inner.lock_slot();
            slot.generation += 1;
            if let Some(task) = slot.watcher.take() {
                task.abort();
            }
            if let Some(task) = slot.recovery.take() {
                task.abort();
            }
            let attempt = slot.attempt.take();
            if let Some(attempt) = &attempt {
                attempt
                    .decided
                    .settle(Err(PortError::Conflict("connection attempt cancelled".to_owned())));
            }
            slot.identity = None;
            let handle = slot.handle.take();
            let settled = matches!(
                slot.state,
                ConnectionState::Idle | ConnectionState::Disconnected
            );
            if !settled || handle.is_some() {
                // Stop is legal from every state.
                let _ = self.inner.apply(&mut slot, ConnectionAction::Stop);
            }
            (handle, attempt)
        };

        // The cancelled attempt closes its own partial handle before exiting.
        if let Some(attempt) = attempt {
            let _ = attempt.task.await;
        }
        match handle {
            Some(handle) => {
                let result = handle.disconnect().await;
                if let Err(e) = &result {
                    tracing::warn!(chain = %self.inner.slug, error = %e, "handle close failed");
                } else {
                    tracing::info!(chain = %self.inner.slug, url = %handle.endpoint().url, "disconnected");
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Switches to another provider URL. The old handle is closed before the
    /// new one is opened; concurrent switches run one at a time.
    pub async fn update_endpoint(&self, url: impl Into<String>) -> Result<(), PortError> {
        let url = url.into();
        let _switching = self.inner.switch_lock.lock().await;
        if self.inner.endpoint().url == url {
            self.connect();
            return Ok(());
        }

        self.wait_while_connecting(self.inner.config.connect_timeout)
            .await;
        let closed = self.disconnect().await;
        {
            let mut endpoint = self
                .inner
                .endpoint
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tracing::info!(
                chain = %self.inner.slug,
                from = %endpoint.url,
                to = %url,
                "switching provider"
            );
            *endpoint = endpoint.with_url(url);
        }
        self.inner.api_ready_once.store(false, Ordering::SeqCst);
        self.inner.retries.store(0, Ordering::SeqCst);
        self.connect();
        closed
    }

    /// Retries a connection that has never completed a handshake. Once-ready
    /// connections are left to the transport's own redial.
    pub async fn recover_connect(&self) -> Result<(), PortError> {
        if self.is_api_ready_once() {
            tracing::debug!(chain = %self.inner.slug, "recover skipped, api was ready once");
            return Ok(());
        }
        if self.status() == ConnectionStatus::Connecting {
            return Ok(());
        }
        tracing::info!(chain = %self.inner.slug, "recovering connection");
        if let Err(e) = self.disconnect().await {
            tracing::warn!(chain = %self.inner.slug, error = %e, "close before recover failed");
        }
        self.connect();
        Ok(())
    }

    /// Waits until the connection reports Connected.
    pub async fn ready(&self, timeout: Duration) -> Result<(), PortError> {
        let deadline = Instant::now() + timeout;
        let mut statuses = self.subscribe();
        loop {
            match timeout_at(deadline, statuses.recv()).await {
                Ok(Some(ConnectionStatus::Connected)) => return Ok(()),
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(PortError::Transport("status channel closed".to_owned()))
                }
                Err(_) => {
                    return Err(PortError::Timeout(format!(
                        "{} not ready within {timeout:?}",
                        self.inner.slug
                    )))
                }
            }
        }
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, PortError> {
        let handle = self
            .inner
            .lock_slot()
            .handle
            .clone()
            .ok_or_else(|| PortError::NotFound(format!("no live handle for {}", self.inner.slug)))?;
        handle.request(method, params).await
    }

    /// Runs `task` after `delay` unless cancelled first. Replaces any
    /// previously scheduled recovery.
    pub fn schedule_recovery<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let mut slot = self.inner.lock_slot();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detach before running so the task cannot abort itself.
            match weak.upgrade() {
                Some(inner) => drop(inner.lock_slot().recovery.take()),
                None => return,
            }
            task.await;
        });
        if let Some(previous) = slot.recovery.replace(timer) {
            previous.abort();
        }
    }

    pub fn cancel_recovery(&self) {
        if let Some(timer) = self.inner.lock_slot().recovery.take() {
            timer.abort();
        }
    }

    pub fn has_pending_recovery(&self) -> bool {
        self.inner.lock_slot().recovery.is_some()
    }

    async fn wait_while_connecting(&self, budget: Duration) {
        let deadline = Instant::now() + budget;
        let mut statuses = self.subscribe();
        while self.status() == ConnectionStatus::Connecting {
            match timeout_at(deadline, statuses.recv()).await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }
}

impl ConnectionInner {
    fn endpoint(&self) -> Endpoint {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `action` and publishes the resulting status while the slot is
    /// held, so subscribers see transitions in the order they happened.
    fn apply(&self, slot: &mut Slot, action: ConnectionAction) -> Result<ConnectionStatus, PortError> {
        let (next, transition) = connection_transition(slot.state, action)?;
        slot.state = next;
        tracing::debug!(
            chain = %self.slug,
            from = ?transition.from,
            to = ?transition.to,
            reason = transition.reason,
            "connection transition"
        );
        let status = next.status();
        self.status.publish(status);
        Ok(status)
    }

    async fn finish_attempt(
        inner: &Arc<ConnectionInner>,
        generation: u64,
        endpoint: Endpoint,
        result: ProbeResult,
    ) {
        let stale_handle = {
            let mut slot = inner.lock_slot();
            if slot.generation != generation {
                result.handle
            } else {
                slot.attempt = None;
                match (result.connected, result.handle) {
                    (true, Some(handle)) => {
                        slot.handle = Some(handle);
                        slot.identity = result.identity;
                        inner.api_ready_once.store(true, Ordering::SeqCst);
                        inner.retries.store(0, Ordering::SeqCst);
                        if let Err(e) = inner.apply(&mut slot, ConnectionAction::HandshakeOk) {
                            tracing::warn!(chain = %inner.slug, error = %e, "unexpected handshake state");
                        }
                        if let Some(signals) = result.signals {
                            slot.watcher = Some(tokio::spawn(Self::watch(
                                Arc::downgrade(inner),
                                generation,
                                signals,
                            )));
                        }
                        tracing::info!(
                            chain = %inner.slug,
                            provider = %endpoint.provider_name,
                            url = %endpoint.url,
                            "connected"
                        );
                        None
                    }
                    (_, handle) => {
                        if let Err(e) = inner.apply(&mut slot, ConnectionAction::HandshakeFailed) {
                            tracing::warn!(chain = %inner.slug, error = %e, "unexpected handshake state");
                        }
                        tracing::warn!(
                            chain = %inner.slug,
                            url = %endpoint.url,
                            error = result.error.as_deref().unwrap_or_default(),
                            "connection attempt failed"
                        );
                        handle
                    }
                }
            }
        };
        if let Some(handle) = stale_handle {
            close_handle(handle.as_ref()).await;
        }
    }

    async fn watch(
        weak: std::sync::Weak<ConnectionInner>,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<HandleSignal>,
    ) {
        while let Some(signal) = signals.recv().await {
            let Some(inner) = weak.upgrade() else { return };
            let abandoned = {
                let mut slot = inner.lock_slot();
                if slot.generation != generation {
                    return;
                }
                let dropped = match signal {
                    HandleSignal::Connected => {
                        inner.retries.store(0, Ordering::SeqCst);
                        let _ = inner.apply(&mut slot, ConnectionAction::TransportRestored);
                        false
                    }
                    HandleSignal::Disconnected => true,
                    // While dropped, an error is a failed redial.
                    HandleSignal::Error(message) if slot.state == ConnectionState::Disconnected => {
                        tracing::debug!(chain = %inner.slug, error = %message, "reconnect failed");
                        true
                    }
                    HandleSignal::Error(message) => {
                        tracing::warn!(chain = %inner.slug, error = %message, "transport error");
                        false
                    }
                };
                if !dropped {
                    None
                } else {
                    let retries = inner.retries.fetch_add(1, Ordering::SeqCst) + 1;
                    if retries > inner.config.max_consecutive_retries {
                        tracing::warn!(
                            chain = %inner.slug,
                            retries,
                            "connection unstable, giving up"
                        );
                        slot.generation += 1;
                        slot.watcher = None;
                        slot.identity = None;
                        let _ = inner.apply(&mut slot, ConnectionAction::GiveUp);
                        slot.handle.take()
                    } else {
                        if slot.state != ConnectionState::Disconnected {
                            tracing::info!(chain = %inner.slug, retries, "connection dropped");
                            let _ = inner.apply(&mut slot, ConnectionAction::TransportLost);
                        }
                        None
                    }
                }
            };
            if let Some(handle) = abandoned {
                close_handle(handle.as_ref()).await;
                return;
            }
        }
    }
}
