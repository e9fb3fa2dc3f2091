mod auth;
mod evm;
mod metadata;
mod substrate;

use thiserror::Error;

use crate::domain::Rejection;
use crate::ports::PortError;
use crate::queue::QueueError;

pub use auth::{strip_url, AuthRequestHandler, AuthResolution, AuthorizeStep};
pub use evm::{
    canonical_json_bytes, route_rpc, ConfirmationOptions, EvmRequestHandler, EXTENSION_ORIGIN,
};
pub use metadata::{MetadataRequestHandler, MetadataStep};
pub use substrate::SubstrateSignHandler;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("request rejected: {0}")]
    Rejected(Rejection),
    #[error("{0}")]
    Policy(String),
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl From<Rejection> for RequestError {
    fn from(value: Rejection) -> Self {
        Self::Rejected(value)
    }
}
