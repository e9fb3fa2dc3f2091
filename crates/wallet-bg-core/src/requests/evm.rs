use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::keccak256;
use serde_json::{json, Map, Value};

use crate::domain::{
    EvmConfirmation, EvmConfirmationType, QueueEntry, Rejection, RequestId, RequestKind,
    RequestOutcome, RequestPayload, TimestampMs,
};
use crate::ports::{ClockPort, EvmSignerPort, PortError};
use crate::queue::{ClaimGuard, PendingResponse, QueueError, RequestQueueStore, Validator};

use super::RequestError;

/// Origin prefix of requests raised by the wallet's own pages.
pub const EXTENSION_ORIGIN: &str = "chrome-extension://";

#[derive(Default)]
pub struct ConfirmationOptions {
    pub id: Option<RequestId>,
    pub tab_id: Option<u32>,
    pub validator: Option<Validator>,
}

pub struct EvmRequestHandler {
    queue: Arc<RequestQueueStore>,
    clock: Arc<dyn ClockPort>,
    internal_origin: String,
}

impl EvmRequestHandler {
    pub fn new(queue: Arc<RequestQueueStore>, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            queue,
            clock,
            internal_origin: EXTENSION_ORIGIN.to_owned(),
        }
    }

    pub fn with_internal_origin(mut self, origin: impl Into<String>) -> Self {
        self.internal_origin = origin.into();
        self
    }

    pub fn is_internal(&self, url: &str) -> bool {
        url.starts_with(&self.internal_origin)
    }

    /// Queues a confirmation. The same payload from the same URL under the
    /// same type may only be pending once.
    pub fn add_confirmation(
        &self,
        url: &str,
        confirmation_type: EvmConfirmationType,
        payload: Value,
        options: ConfirmationOptions,
    ) -> Result<PendingResponse, RequestError> {
        let payload_digest = keccak256(canonical_json_bytes(&payload)?);
        let duplicates = self.queue.find(RequestKind::EvmRequest, |entry| {
            entry.url == url
                && matches!(
                    &entry.payload,
                    RequestPayload::Evm(c)
                        if c.confirmation_type == confirmation_type && c.payload_digest == payload_digest
                )
        });
        if let Some(existing) = duplicates.first() {
            tracing::warn!(url, request_id = %existing.id, "duplicate evm request");
            return Err(RequestError::DuplicateRequest(format!(
                "{} from {url} is already pending",
                confirmation_type.rpc_method()
            )));
        }

        let mut entry = QueueEntry::new(
            options.id.unwrap_or_else(RequestId::generate),
            url,
            RequestPayload::Evm(EvmConfirmation {
                confirmation_type,
                payload,
                payload_digest,
            }),
        );
        entry.tab_id = options.tab_id;
        entry.is_internal = self.is_internal(url);
        entry.created_at_ms = TimestampMs(self.clock.now_ms()?);
        tracing::info!(
            request_id = %entry.id,
            url,
            method = confirmation_type.rpc_method(),
            internal = entry.is_internal,
            "evm confirmation queued"
        );
        Ok(self.queue.enqueue(entry, options.validator)?)
    }

    pub fn update_confirmation(
        &self,
        id: &RequestId,
        confirmation_type: EvmConfirmationType,
        payload: Value,
    ) -> Result<(), RequestError> {
        let payload_digest = keccak256(canonical_json_bytes(&payload)?);
        self.queue.update_payload(
            id,
            RequestPayload::Evm(EvmConfirmation {
                confirmation_type,
                payload,
                payload_digest,
            }),
        )?;
        Ok(())
    }

    /// Resolves with `result`. An empty result on a signing or transaction
    /// confirmation is filled in by `signer` before the validator runs.
    pub async fn complete_confirmation(
        &self,
        id: &RequestId,
        result: Value,
        signer: Option<&dyn EvmSignerPort>,
    ) -> Result<Value, RequestError> {
        let (guard, result) = self.prepare_completion(id, result, signer).await?;
        guard.resolve(RequestOutcome::Evm(result.clone()))?;
        Ok(result)
    }

    /// Claims `id` and produces the final result without settling it. The
    /// entry stays pending until the returned guard resolves it.
    pub async fn prepare_completion(
        &self,
        id: &RequestId,
        result: Value,
        signer: Option<&dyn EvmSignerPort>,
    ) -> Result<(ClaimGuard<'_>, Value), RequestError> {
        let guard = self.queue.claim(id)?;
        let RequestPayload::Evm(confirmation) = guard.entry().payload.clone() else {
            return Err(QueueError::KindMismatch {
                expected: RequestKind::EvmRequest,
                actual: guard.entry().kind,
            }
            .into());
        };
        let needs_signer = is_empty(&result)
            && (confirmation.confirmation_type.is_signature()
                || confirmation.confirmation_type == EvmConfirmationType::SendTransaction);
        if !needs_signer {
            return Ok((guard, result));
        }
        let signer = signer.ok_or_else(|| {
            PortError::Validation(format!(
                "{} needs a signer to complete",
                confirmation.confirmation_type.rpc_method()
            ))
        })?;
        let signed = signer
            .sign(confirmation.confirmation_type, &confirmation.payload)
            .await?;
        Ok((guard, signed))
    }

    pub fn reject_confirmation(&self, id: &RequestId) -> Result<(), RequestError> {
        self.queue
            .reject(id, Rejection::rejected("User Rejected Request"))?;
        Ok(())
    }

    pub fn num_requests(&self) -> usize {
        self.queue.num_pending(RequestKind::EvmRequest)
    }

    /// Pending confirmations grouped by type, each group in arrival order.
    pub fn confirmations(&self) -> BTreeMap<EvmConfirmationType, Vec<QueueEntry>> {
        let mut grouped: BTreeMap<EvmConfirmationType, Vec<QueueEntry>> = BTreeMap::new();
        for entry in self.queue.snapshot(RequestKind::EvmRequest) {
            if let RequestPayload::Evm(confirmation) = &entry.payload {
                grouped
                    .entry(confirmation.confirmation_type)
                    .or_default()
                    .push(entry);
            }
        }
        grouped
    }

    pub fn reset(&self) -> Result<usize, RequestError> {
        Ok(self
            .queue
            .reject_kind(RequestKind::EvmRequest, Rejection::reset())?)
    }
}

/// Maps a dApp RPC call onto a confirmation type and the payload queued for it.
pub fn route_rpc(method: &str, params: &Value) -> Result<(EvmConfirmationType, Value), RequestError> {
    use EvmConfirmationType as T;

    let confirmation_type = EvmConfirmationType::from_rpc_method(method)
        .ok_or_else(|| RequestError::UnsupportedMethod(method.to_owned()))?;
    let payload = match confirmation_type {
        T::RequestAccounts => Value::Null,
        T::EthSign | T::SignTypedDataV3 | T::SignTypedDataV4 => {
            let (address, data) = (param(params, 0, method)?, param(params, 1, method)?);
            json!({ "address": address, "payload": data })
        }
        T::PersonalSign | T::SignTypedData | T::SignTypedDataV1 => {
            let (data, address) = (param(params, 0, method)?, param(params, 1, method)?);
            json!({ "address": address, "payload": data })
        }
        T::SendTransaction | T::AddNetwork | T::SwitchNetwork => {
            let object = param(params, 0, method)?;
            if !object.is_object() {
                return Err(RequestError::InvalidParams(format!(
                    "{method} expects an object parameter"
                )));
            }
            object.clone()
        }
        T::AddToken => {
            let object = match params {
                Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            if !object.is_object() {
                return Err(RequestError::InvalidParams(format!(
                    "{method} expects an asset object"
                )));
            }
            object
        }
    };
    Ok((confirmation_type, payload))
}

fn param<'a>(params: &'a Value, index: usize, method: &str) -> Result<&'a Value, RequestError> {
    params
        .as_array()
        .and_then(|items| items.get(index))
        .ok_or_else(|| RequestError::InvalidParams(format!("{method} is missing parameter {index}")))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, PortError> {
    serde_json::to_vec(&normalize_json(value))
        .map_err(|e| PortError::Validation(format!("canonical json serialization failed: {e}")))
}

fn normalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            let mut out = Map::with_capacity(keys.len());
            for key in keys {
                if let Some(v) = map.get(key) {
                    out.insert(key.clone(), normalize_json(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_json).collect()),
        _ => value.clone(),
    }
}
