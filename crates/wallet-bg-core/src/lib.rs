pub mod chain_service;
pub mod completion;
pub mod connection;
pub mod domain;
pub mod handler;
pub mod popup;
pub mod ports;
pub mod probe;
pub mod queue;
pub mod requests;
pub mod rpc;
pub mod service;
pub mod state_machine;
pub mod status;

pub use chain_service::{ChainService, ChainValidationError, ValidateNetworkResponse};
pub use completion::{completion, Completion};
pub use connection::{
    ChainConnection, ConnectionConfig, API_AUTO_CONNECT_MS, MAX_CONSECUTIVE_RETRIES,
};
pub use domain::{
    is_ethereum_address, AccountAuthType, AuthDecision, AuthPayload, AuthUrlEntry, AuthUrls,
    AuthorizeRequest, ChainFamily, ChainIdentity, ChainInfo, ChainSlug, ChainSpec,
    ConnectionStatus, DerivationIndices, Endpoint, EntryStatus, EvmConfirmation,
    EvmConfirmationType, ExtrinsicPayload, MetadataDef, NotificationMode, QrPayload, QueueEntry,
    RawKind, RawPayload, Rejection, RejectionCode, RequestId, RequestKind, RequestOutcome,
    RequestPayload, SignPayload, SignRequest, SignatureOutcome, TimestampMs, WindowId,
};
pub use handler::{ChainHandler, HandlerConfig, InitOptions, StatusCallback, API_MAX_RETRY};
pub use popup::PopupCoordinator;
pub use ports::{
    ActionBadgePort, AuthStorePort, ChainRegistryPort, ClockPort, EvmSignerPort, HandleSignal,
    HardwareSignerPort, KeyringSignerPort, MetadataStorePort, PasswordGatePort, PortError,
    RpcHandle, RpcTransport,
};
pub use probe::{
    default_probe_timeout, probe, ProbeErrorKind, ProbeResult, EVM_PROBE_TIMEOUT,
    SUBSTRATE_PROBE_TIMEOUT,
};
pub use queue::{ClaimGuard, PendingResponse, QueueError, RequestQueueStore, Response, Validator};
pub use requests::{
    canonical_json_bytes, route_rpc, strip_url, AuthRequestHandler, AuthResolution,
    AuthorizeStep, ConfirmationOptions, EvmRequestHandler, MetadataRequestHandler, MetadataStep,
    RequestError, SubstrateSignHandler, EXTENSION_ORIGIN,
};
pub use service::RequestService;
pub use state_machine::{
    connection_transition, ConnectionAction, ConnectionState, StateTransition,
};
pub use status::{StatusChannel, StatusReceiver};
