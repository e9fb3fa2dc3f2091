use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy::hex;
use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ports::PortError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimestampMs(pub u64);

const MAX_SLUG_LEN: usize = 64;

/// Registry key of a chain (`polkadot`, `ethereum`, `moonbeam`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainSlug(String);

impl ChainSlug {
    pub fn new(raw: impl Into<String>) -> Result<Self, PortError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_SLUG_LEN {
            return Err(PortError::Validation(format!(
                "chain slug must be 1..={MAX_SLUG_LEN} characters: {raw:?}"
            )));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(PortError::Validation(format!(
                "chain slug contains invalid characters: {raw:?}"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChainSlug {
    type Error = PortError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChainSlug> for String {
    fn from(value: ChainSlug) -> Self {
        value.0
    }
}

impl FromStr for ChainSlug {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ChainSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Substrate,
    Evm,
}

impl ChainFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Substrate => "substrate",
            Self::Evm => "evm",
        }
    }

    /// Guesses the family from a provider URL scheme (`ws*` or `http*`).
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Some(Self::Substrate)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Some(Self::Evm)
        } else {
            None
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One RPC provider of one chain. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub chain: ChainSlug,
    pub provider_name: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(chain: ChainSlug, provider_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            chain,
            provider_name: provider_name.into(),
            url: url.into(),
        }
    }

    /// Same provider name and chain, different URL.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            chain: self.chain.clone(),
            provider_name: self.provider_name.clone(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChainIdentity {
    Genesis(B256),
    EvmChainId(u64),
}

impl fmt::Display for ChainIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Genesis(hash) => write!(f, "genesis:{hash}"),
            Self::EvmChainId(id) => write!(f, "chain-id:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry record for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainInfo {
    pub slug: ChainSlug,
    pub name: String,
    pub family: ChainFamily,
    /// Provider name -> URL, first entry is the default provider.
    pub providers: BTreeMap<String, String>,
    #[serde(default)]
    pub genesis_hash: Option<B256>,
    #[serde(default)]
    pub evm_chain_id: Option<u64>,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub decimals: u8,
    #[serde(default)]
    pub active: bool,
}

impl ChainInfo {
    pub fn identity(&self) -> Option<ChainIdentity> {
        match self.family {
            ChainFamily::Substrate => self.genesis_hash.map(ChainIdentity::Genesis),
            ChainFamily::Evm => self.evm_chain_id.map(ChainIdentity::EvmChainId),
        }
    }

    pub fn default_endpoint(&self) -> Option<Endpoint> {
        self.providers
            .iter()
            .next()
            .map(|(name, url)| Endpoint::new(self.slug.clone(), name.clone(), url.clone()))
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.providers
            .iter()
            .map(|(name, url)| Endpoint::new(self.slug.clone(), name.clone(), url.clone()))
            .collect()
    }

    pub fn has_provider_url(&self, url: &str) -> bool {
        self.providers.values().any(|u| u == url)
    }
}

/// Best-effort chain description read from a live connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSpec {
    pub name: String,
    pub genesis_hash: Option<B256>,
    pub evm_chain_id: Option<u64>,
    pub symbol: String,
    pub decimals: u8,
    pub address_prefix: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Auth,
    Metadata,
    SubstrateSign,
    EvmRequest,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Auth,
        RequestKind::Metadata,
        RequestKind::SubstrateSign,
        RequestKind::EvmRequest,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Auth => 0,
            Self::Metadata => 1,
            Self::SubstrateSign => 2,
            Self::EvmRequest => 3,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Metadata => "metadata",
            Self::SubstrateSign => "substrate_sign",
            Self::EvmRequest => "evm_request",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountAuthType {
    Substrate,
    Evm,
    Both,
}

impl AccountAuthType {
    /// Whether an address of this shape belongs to the requested account type.
    pub fn accepts(&self, address: &str) -> bool {
        match self {
            Self::Both => true,
            Self::Evm => is_ethereum_address(address),
            Self::Substrate => !is_ethereum_address(address),
        }
    }

    pub fn covers(&self, requested: AccountAuthType) -> bool {
        *self == AccountAuthType::Both || *self == requested
    }

    pub fn merge(self, other: AccountAuthType) -> AccountAuthType {
        if self == other {
            self
        } else {
            AccountAuthType::Both
        }
    }
}

pub fn is_ethereum_address(address: &str) -> bool {
    address.parse::<alloy::primitives::Address>().is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub origin: String,
    pub account_auth_type: AccountAuthType,
    #[serde(default)]
    pub allowed_accounts: Vec<String>,
    #[serde(default)]
    pub reconfirm: bool,
}

/// Queued authorization: the request plus the stripped origin key it is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub id_str: String,
    pub request: AuthorizeRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDecision {
    pub approved: bool,
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUrlEntry {
    pub id: String,
    pub origin: String,
    pub url: String,
    pub is_allowed: bool,
    pub is_allowed_map: BTreeMap<String, bool>,
    pub account_auth_type: AccountAuthType,
    pub last_auth_ms: TimestampMs,
    pub count: u32,
    #[serde(default)]
    pub current_evm_network: Option<ChainSlug>,
}

impl AuthUrlEntry {
    pub fn allowed_accounts(&self, account_type: AccountAuthType) -> Vec<String> {
        self.is_allowed_map
            .iter()
            .filter(|(address, allowed)| **allowed && account_type.accepts(address))
            .map(|(address, _)| address.clone())
            .collect()
    }
}

pub type AuthUrls = BTreeMap<String, AuthUrlEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDef {
    pub chain: String,
    pub genesis_hash: B256,
    pub spec_version: u32,
    pub ss58_format: u16,
    pub token_decimals: u8,
    pub token_symbol: String,
    #[serde(default)]
    pub types: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrinsicPayload {
    pub address: String,
    pub genesis_hash: B256,
    pub block_hash: B256,
    pub method: String,
    pub era: String,
    pub nonce: u64,
    pub tip: u128,
    pub spec_version: u32,
    pub transaction_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawKind {
    Bytes,
    Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPayload {
    pub address: String,
    pub data: String,
    #[serde(rename = "type")]
    pub kind: RawKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignPayload {
    Extrinsic(ExtrinsicPayload),
    Raw(RawPayload),
}

impl SignPayload {
    pub fn address(&self) -> &str {
        match self {
            Self::Extrinsic(p) => &p.address,
            Self::Raw(p) => &p.address,
        }
    }

    pub fn genesis_hash(&self) -> Option<B256> {
        match self {
            Self::Extrinsic(p) => Some(p.genesis_hash),
            Self::Raw(_) => None,
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, Self::Raw(_))
    }

    pub fn validate(&self) -> Result<(), PortError> {
        if self.address().trim().is_empty() {
            return Err(PortError::Validation("sign payload has no address".to_owned()));
        }
        match self {
            Self::Extrinsic(p) => {
                decode_hex_field("method", &p.method)?;
                if p.genesis_hash == B256::ZERO {
                    return Err(PortError::Validation(
                        "extrinsic genesis hash is zero".to_owned(),
                    ));
                }
                Ok(())
            }
            Self::Raw(p) => {
                if p.data.is_empty() {
                    return Err(PortError::Validation("raw payload data is empty".to_owned()));
                }
                Ok(())
            }
        }
    }

    /// Bytes handed to the external signer. Raw `bytes` payloads are wrapped
    /// in `<Bytes>..</Bytes>` so a message can never double as an extrinsic.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, PortError> {
        match self {
            Self::Extrinsic(p) => {
                let mut out = decode_hex_field("method", &p.method)?;
                if !p.era.is_empty() {
                    out.extend(decode_hex_field("era", &p.era)?);
                }
                out.extend_from_slice(&p.nonce.to_le_bytes());
                out.extend_from_slice(&p.tip.to_le_bytes());
                out.extend_from_slice(&p.spec_version.to_le_bytes());
                out.extend_from_slice(&p.transaction_version.to_le_bytes());
                out.extend_from_slice(p.genesis_hash.as_slice());
                out.extend_from_slice(p.block_hash.as_slice());
                Ok(out)
            }
            Self::Raw(p) => {
                let data = if p.data.starts_with("0x") {
                    decode_hex_field("data", &p.data)?
                } else {
                    p.data.as_bytes().to_vec()
                };
                match p.kind {
                    RawKind::Bytes => {
                        let mut out = b"<Bytes>".to_vec();
                        out.extend(data);
                        out.extend_from_slice(b"</Bytes>");
                        Ok(out)
                    }
                    RawKind::Payload => Ok(data),
                }
            }
        }
    }
}

fn decode_hex_field(field: &str, value: &str) -> Result<Vec<u8>, PortError> {
    let bytes = hex::decode(value)
        .map_err(|e| PortError::Validation(format!("{field} is not valid hex: {e}")))?;
    if bytes.is_empty() {
        return Err(PortError::Validation(format!("{field} is empty")));
    }
    Ok(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub account: String,
    pub payload: SignPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureOutcome {
    pub signature: String,
    #[serde(default)]
    pub signed_transaction: Option<String>,
}

/// Payload shown to an air-gapped signer as a QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub address: String,
    pub genesis_hash: Option<B256>,
    pub data: String,
    pub is_message: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationIndices {
    pub account_index: u32,
    pub address_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvmConfirmationType {
    RequestAccounts,
    EthSign,
    PersonalSign,
    SignTypedData,
    SignTypedDataV1,
    SignTypedDataV3,
    SignTypedDataV4,
    SendTransaction,
    AddNetwork,
    AddToken,
    SwitchNetwork,
}

impl EvmConfirmationType {
    pub const ALL: [EvmConfirmationType; 11] = [
        Self::RequestAccounts,
        Self::EthSign,
        Self::PersonalSign,
        Self::SignTypedData,
        Self::SignTypedDataV1,
        Self::SignTypedDataV3,
        Self::SignTypedDataV4,
        Self::SendTransaction,
        Self::AddNetwork,
        Self::AddToken,
        Self::SwitchNetwork,
    ];

    pub fn from_rpc_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.rpc_method() == method)
    }

    pub fn rpc_method(&self) -> &'static str {
        match self {
            Self::RequestAccounts => "eth_requestAccounts",
            Self::EthSign => "eth_sign",
            Self::PersonalSign => "personal_sign",
            Self::SignTypedData => "eth_signTypedData",
            Self::SignTypedDataV1 => "eth_signTypedData_v1",
            Self::SignTypedDataV3 => "eth_signTypedData_v3",
            Self::SignTypedDataV4 => "eth_signTypedData_v4",
            Self::SendTransaction => "eth_sendTransaction",
            Self::AddNetwork => "wallet_addEthereumChain",
            Self::AddToken => "wallet_watchAsset",
            Self::SwitchNetwork => "wallet_switchEthereumChain",
        }
    }

    pub fn is_signature(&self) -> bool {
        matches!(
            self,
            Self::EthSign
                | Self::PersonalSign
                | Self::SignTypedData
                | Self::SignTypedDataV1
                | Self::SignTypedDataV3
                | Self::SignTypedDataV4
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmConfirmation {
    pub confirmation_type: EvmConfirmationType,
    pub payload: Value,
    pub payload_digest: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RequestPayload {
    Auth(AuthPayload),
    Metadata(MetadataDef),
    SubstrateSign(SignRequest),
    Evm(EvmConfirmation),
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Auth(_) => RequestKind::Auth,
            Self::Metadata(_) => RequestKind::Metadata,
            Self::SubstrateSign(_) => RequestKind::SubstrateSign,
            Self::Evm(_) => RequestKind::EvmRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RequestOutcome {
    Auth(AuthDecision),
    Metadata(bool),
    Signature(SignatureOutcome),
    Evm(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    Rejected,
    Cancelled,
    ValidatorRejected,
    Policy,
    Reset,
    Dropped,
}

/// What a requester receives when its entry is not resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
}

impl Rejection {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::Rejected,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: RejectionCode::Cancelled,
            message: "Cancelled".to_owned(),
        }
    }

    pub fn validator(message: impl Into<String>) -> Self {
        Self {
            code: RejectionCode::ValidatorRejected,
            message: message.into(),
        }
    }

    pub fn reset() -> Self {
        Self {
            code: RejectionCode::Reset,
            message: "Reset wallet".to_owned(),
        }
    }

    pub fn dropped() -> Self {
        Self {
            code: RejectionCode::Dropped,
            message: "request dropped before resolution".to_owned(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: RequestId,
    pub kind: RequestKind,
    pub url: String,
    pub tab_id: Option<u32>,
    pub payload: RequestPayload,
    pub status: EntryStatus,
    pub is_internal: bool,
    pub created_at_ms: TimestampMs,
}

impl QueueEntry {
    pub fn new(id: RequestId, url: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            id,
            kind: payload.kind(),
            url: url.into(),
            tab_id: None,
            payload,
            status: EntryStatus::Pending,
            is_internal: false,
            created_at_ms: TimestampMs(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    #[default]
    Popup,
    Window,
    Extension,
}

impl FromStr for NotificationMode {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "popup" => Ok(Self::Popup),
            "window" => Ok(Self::Window),
            "extension" => Ok(Self::Extension),
            other => Err(PortError::Validation(format!(
                "unknown notification mode: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(pub u64);
