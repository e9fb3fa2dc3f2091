pub mod badge;
pub mod clock;
pub mod config;
pub mod http;
pub mod password;
pub mod registry;
pub mod store;
pub mod ws;

pub use badge::TracingBadge;
pub use clock::SystemClockAdapter;
pub use config::RuntimeConfig;
pub use http::{EvmHttpHandle, EvmHttpTransport};
pub use password::{KdfAlgorithm, KdfParams, PasswordGate, PasswordRecord};
pub use registry::StaticChainRegistry;
pub use store::{JsonFileStore, MemoryStore};
pub use ws::{SubstrateWsTransport, WsHandle};
