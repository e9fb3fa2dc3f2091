#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use wallet_bg_core::{
    ActionBadgePort, AuthStorePort, AuthUrls, ChainFamily, ChainIdentity, ChainInfo,
    ChainRegistryPort, ChainSlug, ClockPort, DerivationIndices, Endpoint, EvmConfirmationType,
    EvmSignerPort, HandleSignal, HardwareSignerPort, KeyringSignerPort, MetadataDef,
    MetadataStorePort, NotificationMode, PasswordGatePort, PortError, RequestService, RpcHandle,
    RpcTransport, WindowId,
};

pub fn genesis(seed: u8) -> B256 {
    B256::repeat_byte(seed)
}

pub fn slug(raw: &str) -> ChainSlug {
    ChainSlug::new(raw).expect("valid slug")
}

pub fn endpoint(chain: &str, url: &str) -> Endpoint {
    Endpoint::new(slug(chain), "test", url)
}

/// Polls `check` until it holds, failing the test after ~5s of (virtual) time.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Answer(ChainIdentity),
    AnswerAfter(Duration, ChainIdentity),
    Hang,
    FailOpen(String),
    SignalError(String),
}

#[derive(Default)]
struct Shared {
    behaviors: Mutex<HashMap<String, Behavior>>,
    responses: Mutex<HashMap<String, Value>>,
    fail_close: Mutex<HashSet<String>>,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    events: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Transport whose handles are scripted per URL and that records every
/// open and close.
#[derive(Clone)]
pub struct FakeTransport {
    family: ChainFamily,
    default: Behavior,
    shared: Arc<Shared>,
}

impl FakeTransport {
    pub fn new(family: ChainFamily, default: Behavior) -> Self {
        Self {
            family,
            default,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn substrate(identity: ChainIdentity) -> Self {
        Self::new(ChainFamily::Substrate, Behavior::Answer(identity))
    }

    pub fn set_behavior(&self, url: &str, behavior: Behavior) {
        self.shared
            .behaviors
            .lock()
            .expect("behaviors")
            .insert(url.to_owned(), behavior);
    }

    pub fn set_response(&self, method: &str, value: Value) {
        self.shared
            .responses
            .lock()
            .expect("responses")
            .insert(method.to_owned(), value);
    }

    pub fn fail_close(&self, url: &str) {
        self.shared
            .fail_close
            .lock()
            .expect("fail close")
            .insert(url.to_owned());
    }

    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }

    pub fn events(&self) -> Vec<String> {
        self.shared.events.lock().expect("events").clone()
    }

    pub fn last_handle(&self, url: &str) -> Arc<FakeHandle> {
        self.shared
            .handles
            .lock()
            .expect("handles")
            .iter()
            .rev()
            .find(|h| h.endpoint.url == url)
            .cloned()
            .expect("handle for url")
    }

    pub fn into_dyn(self) -> Arc<dyn RpcTransport> {
        Arc::new(self)
    }
}

#[async_trait]
impl RpcTransport for FakeTransport {
    fn family(&self) -> ChainFamily {
        self.family
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcHandle>, PortError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .shared
            .behaviors
            .lock()
            .expect("behaviors")
            .get(&endpoint.url)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        if let Behavior::FailOpen(message) = &behavior {
            return Err(PortError::Transport(message.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if let Behavior::SignalError(message) = &behavior {
            tx.send(HandleSignal::Error(message.clone()))
                .expect("signal receiver alive");
        }
        let handle = Arc::new(FakeHandle {
            endpoint: endpoint.clone(),
            behavior,
            shared: Arc::clone(&self.shared),
            signals_tx: tx,
            signals_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        });
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        self.shared
            .events
            .lock()
            .expect("events")
            .push(format!("open:{}", endpoint.url));
        self.shared
            .handles
            .lock()
            .expect("handles")
            .push(Arc::clone(&handle));
        Ok(handle)
    }
}

pub struct FakeHandle {
    endpoint: Endpoint,
    behavior: Behavior,
    shared: Arc<Shared>,
    signals_tx: mpsc::UnboundedSender<HandleSignal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<HandleSignal>>>,
    closed: AtomicBool,
}

impl FakeHandle {
    pub fn emit(&self, signal: HandleSignal) {
        // The watcher may already be gone; tests check state, not delivery.
        let _ = self.signals_tx.send(signal);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcHandle for FakeHandle {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<HandleSignal>> {
        self.signals_rx.lock().expect("signals").take()
    }

    async fn handshake(&self) -> Result<ChainIdentity, PortError> {
        match &self.behavior {
            Behavior::Answer(identity) => Ok(*identity),
            Behavior::AnswerAfter(delay, identity) => {
                tokio::time::sleep(*delay).await;
                Ok(*identity)
            }
            Behavior::Hang | Behavior::SignalError(_) | Behavior::FailOpen(_) => {
                futures::future::pending().await
            }
        }
    }

    async fn request(&self, method: &str, _params: Value) -> Result<Value, PortError> {
        self.shared
            .responses
            .lock()
            .expect("responses")
            .get(method)
            .cloned()
            .ok_or_else(|| PortError::Transport(format!("no scripted response for {method}")))
    }

    async fn disconnect(&self) -> Result<(), PortError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        self.shared
            .events
            .lock()
            .expect("events")
            .push(format!("close:{}", self.endpoint.url));
        if self
            .shared
            .fail_close
            .lock()
            .expect("fail close")
            .contains(&self.endpoint.url)
        {
            return Err(PortError::Transport("close failed".to_owned()));
        }
        Ok(())
    }
}

pub struct StaticRegistry {
    chains: Vec<ChainInfo>,
}

impl StaticRegistry {
    pub fn new(chains: Vec<ChainInfo>) -> Arc<Self> {
        Arc::new(Self { chains })
    }
}

impl ChainRegistryPort for StaticRegistry {
    fn chain_info(&self, slug: &ChainSlug) -> Option<ChainInfo> {
        self.chains.iter().find(|c| &c.slug == slug).cloned()
    }

    fn all_chains(&self) -> Vec<ChainInfo> {
        self.chains.clone()
    }

    fn active_chains(&self) -> Vec<ChainSlug> {
        self.chains
            .iter()
            .filter(|c| c.active)
            .map(|c| c.slug.clone())
            .collect()
    }
}

pub fn substrate_chain(name: &str, url: &str, seed: u8) -> ChainInfo {
    ChainInfo {
        slug: slug(name),
        name: name.to_owned(),
        family: ChainFamily::Substrate,
        providers: BTreeMap::from([("test".to_owned(), url.to_owned())]),
        genesis_hash: Some(genesis(seed)),
        evm_chain_id: None,
        symbol: "DOT".to_owned(),
        decimals: 10,
        active: true,
    }
}

pub fn evm_chain(name: &str, url: &str, chain_id: u64) -> ChainInfo {
    ChainInfo {
        slug: slug(name),
        name: name.to_owned(),
        family: ChainFamily::Evm,
        providers: BTreeMap::from([("test".to_owned(), url.to_owned())]),
        genesis_hash: None,
        evm_chain_id: Some(chain_id),
        symbol: "ETH".to_owned(),
        decimals: 18,
        active: true,
    }
}

#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl ClockPort for TestClock {
    fn now_ms(&self) -> Result<u64, PortError> {
        Ok(self.now.fetch_add(1, Ordering::SeqCst) + 1_739_750_400_000)
    }
}

pub fn clock() -> Arc<dyn ClockPort> {
    Arc::new(TestClock::default())
}

#[derive(Clone, Default)]
pub struct MemoryAuthStore {
    urls: Arc<Mutex<AuthUrls>>,
    fail_saves: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryAuthStore {
    pub fn with(urls: AuthUrls) -> Self {
        let store = Self::default();
        *store.urls.lock().expect("urls") = urls;
        store
    }

    pub fn snapshot(&self) -> AuthUrls {
        self.urls.lock().expect("urls").clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthStorePort for MemoryAuthStore {
    async fn load(&self) -> Result<AuthUrls, PortError> {
        Ok(self.snapshot())
    }

    async fn save(&self, urls: &AuthUrls) -> Result<(), PortError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PortError::Transport("disk full".to_owned()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.urls.lock().expect("urls") = urls.clone();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    defs: Arc<Mutex<HashMap<B256, MetadataDef>>>,
}

impl MemoryMetadataStore {
    pub fn with(defs: Vec<MetadataDef>) -> Self {
        let store = Self::default();
        for def in defs {
            store
                .defs
                .lock()
                .expect("defs")
                .insert(def.genesis_hash, def);
        }
        store
    }
}

#[async_trait]
impl MetadataStorePort for MemoryMetadataStore {
    async fn get(&self, genesis_hash: &B256) -> Result<Option<MetadataDef>, PortError> {
        Ok(self.defs.lock().expect("defs").get(genesis_hash).cloned())
    }

    async fn put(&self, def: &MetadataDef) -> Result<(), PortError> {
        self.defs
            .lock()
            .expect("defs")
            .insert(def.genesis_hash, def.clone());
        Ok(())
    }

    async fn all(&self) -> Result<Vec<MetadataDef>, PortError> {
        Ok(self.defs.lock().expect("defs").values().cloned().collect())
    }
}

#[derive(Clone, Default)]
pub struct RecordingBadge {
    badges: Arc<Mutex<Vec<usize>>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    next_window: Arc<AtomicU64>,
    open_delay: Option<Duration>,
    refuse_close: Arc<AtomicBool>,
}

impl RecordingBadge {
    pub fn slow(open_delay: Duration) -> Self {
        Self {
            open_delay: Some(open_delay),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn refuse_close(&self, refuse: bool) {
        self.refuse_close.store(refuse, Ordering::SeqCst);
    }

    pub fn last_badge(&self) -> Option<usize> {
        self.badges.lock().expect("badges").last().copied()
    }
}

#[async_trait]
impl ActionBadgePort for RecordingBadge {
    async fn set_badge(&self, pending: usize) -> Result<(), PortError> {
        self.badges.lock().expect("badges").push(pending);
        Ok(())
    }

    async fn open_popup_window(&self, _mode: NotificationMode) -> Result<WindowId, PortError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(WindowId(self.next_window.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn close_popup_window(&self, window: WindowId) -> Result<(), PortError> {
        if self.refuse_close.load(Ordering::SeqCst) {
            return Err(PortError::Transport(format!("window {} did not close", window.0)));
        }
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub type TestService = RequestService<MemoryAuthStore, MemoryMetadataStore, RecordingBadge>;

pub fn new_service() -> Arc<TestService> {
    service_with(MemoryAuthStore::default(), MemoryMetadataStore::default())
}

pub fn service_with(auth: MemoryAuthStore, metadata: MemoryMetadataStore) -> Arc<TestService> {
    Arc::new(RequestService::new(
        auth,
        metadata,
        RecordingBadge::default(),
        clock(),
        NotificationMode::Popup,
    ))
}

pub const SIGNATURE_64: &str = "0x1111111111111111111111111111111111111111111111111111111111111111\
1111111111111111111111111111111111111111111111111111111111111111";

pub struct FixedSigner;

#[async_trait]
impl KeyringSignerPort for FixedSigner {
    async fn sign(&self, _account: &str, _payload: &[u8]) -> Result<String, PortError> {
        Ok(SIGNATURE_64.to_owned())
    }
}

pub struct PasswordIs(pub &'static str);

impl PasswordGatePort for PasswordIs {
    fn verify(&self, password: &str) -> Result<(), PortError> {
        if password == self.0 {
            Ok(())
        } else {
            Err(PortError::Policy("wrong password".to_owned()))
        }
    }
}

/// Hardware device that fails until told otherwise and can be held
/// mid-signing.
#[derive(Default)]
pub struct ScriptedDevice {
    pub fail: AtomicBool,
    pub gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl HardwareSignerPort for ScriptedDevice {
    async fn sign(
        &self,
        _payload: &[u8],
        _indices: DerivationIndices,
    ) -> Result<String, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PortError::Transport("device disconnected".to_owned()));
        }
        Ok(SIGNATURE_64.to_owned())
    }
}

pub struct EchoEvmSigner;

#[async_trait]
impl EvmSignerPort for EchoEvmSigner {
    async fn sign(
        &self,
        confirmation_type: EvmConfirmationType,
        _payload: &Value,
    ) -> Result<Value, PortError> {
        Ok(Value::String(format!(
            "0xsigned-{}",
            confirmation_type.rpc_method()
        )))
    }
}
