use std::sync::Arc;

use alloy::hex;

use crate::connection::ChainConnection;
use crate::domain::{
    ChainIdentity, DerivationIndices, QrPayload, QueueEntry, Rejection, RequestId, RequestKind,
    RequestOutcome, RequestPayload, SignRequest, SignatureOutcome, TimestampMs,
};
use crate::ports::{ClockPort, HardwareSignerPort, KeyringSignerPort, PasswordGatePort, PortError};
use crate::queue::{ClaimGuard, PendingResponse, QueueError, RequestQueueStore, Validator};

use super::RequestError;

/// Signature lengths accepted from signers: sr25519/ed25519, ecdsa, and
/// either of those with a leading scheme byte.
const SIGNATURE_LENGTHS: [usize; 3] = [64, 65, 66];

pub struct SubstrateSignHandler {
    queue: Arc<RequestQueueStore>,
    clock: Arc<dyn ClockPort>,
}

impl SubstrateSignHandler {
    pub fn new(queue: Arc<RequestQueueStore>, clock: Arc<dyn ClockPort>) -> Self {
        Self { queue, clock }
    }

    /// Validates and queues a signing request. When `chain` is given and has
    /// completed a handshake, the payload must target that chain's genesis.
    pub fn sign(
        &self,
        url: &str,
        request: SignRequest,
        id: Option<RequestId>,
        chain: Option<&ChainConnection>,
    ) -> Result<PendingResponse, RequestError> {
        request.payload.validate()?;
        if let (Some(chain), Some(genesis)) = (chain, request.payload.genesis_hash()) {
            if let Some(identity) = chain.identity() {
                if identity != ChainIdentity::Genesis(genesis) {
                    return Err(PortError::WrongIdentity {
                        expected: identity,
                        actual: ChainIdentity::Genesis(genesis),
                    }
                    .into());
                }
            }
        }
        let mut entry = QueueEntry::new(
            id.unwrap_or_else(RequestId::generate),
            url,
            RequestPayload::SubstrateSign(request),
        );
        entry.created_at_ms = TimestampMs(self.clock.now_ms()?);
        tracing::info!(request_id = %entry.id, url, "signing request queued");
        let validator: Validator = Box::new(|outcome: &RequestOutcome| match outcome {
            RequestOutcome::Signature(signature) => check_signature(&signature.signature),
            other => Err(format!("expected a signature, got {other:?}")),
        });
        Ok(self.queue.enqueue(entry, Some(validator))?)
    }

    pub async fn approve_with_password(
        &self,
        id: &RequestId,
        password: &str,
        gate: &dyn PasswordGatePort,
        signer: &dyn KeyringSignerPort,
    ) -> Result<SignatureOutcome, RequestError> {
        let guard = self.queue.claim(id)?;
        let request = sign_request(&guard)?;
        gate.verify(password)?;
        let bytes = request.payload.signing_bytes()?;
        let signature = signer.sign(&request.account, &bytes).await?;
        settle(guard, signature)
    }

    /// Signs on a hardware device. Any device failure leaves the request
    /// pending so the user can retry.
    pub async fn approve_with_hardware(
        &self,
        id: &RequestId,
        device: &dyn HardwareSignerPort,
        indices: DerivationIndices,
    ) -> Result<SignatureOutcome, RequestError> {
        let guard = self.queue.claim(id)?;
        let request = sign_request(&guard)?;
        let bytes = request.payload.signing_bytes()?;
        let signature = match device.sign(&bytes, indices).await {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "hardware signing failed");
                return Err(e.into());
            }
        };
        settle(guard, signature)
    }

    /// What the air-gapped signer has to sign.
    pub fn qr_payload(&self, id: &RequestId) -> Result<QrPayload, RequestError> {
        let entry = self
            .queue
            .get(id)
            .ok_or_else(|| QueueError::UnknownId(id.clone()))?;
        let RequestPayload::SubstrateSign(request) = entry.payload else {
            return Err(QueueError::KindMismatch {
                expected: RequestKind::SubstrateSign,
                actual: entry.kind,
            }
            .into());
        };
        Ok(QrPayload {
            address: request.payload.address().to_owned(),
            genesis_hash: request.payload.genesis_hash(),
            data: hex::encode_prefixed(request.payload.signing_bytes()?),
            is_message: request.payload.is_message(),
        })
    }

    /// Resolves with a signature scanned back from the air-gapped signer.
    pub fn approve_with_qr(
        &self,
        id: &RequestId,
        signature: &str,
    ) -> Result<SignatureOutcome, RequestError> {
        let guard = self.queue.claim(id)?;
        sign_request(&guard)?;
        settle(guard, signature.to_owned())
    }

    pub fn cancel(&self, id: &RequestId) -> Result<(), RequestError> {
        self.queue.reject(id, Rejection::cancelled())?;
        Ok(())
    }
}

fn sign_request(guard: &ClaimGuard<'_>) -> Result<SignRequest, RequestError> {
    match &guard.entry().payload {
        RequestPayload::SubstrateSign(request) => Ok(request.clone()),
        _ => Err(QueueError::KindMismatch {
            expected: RequestKind::SubstrateSign,
            actual: guard.entry().kind,
        }
        .into()),
    }
}

fn settle(guard: ClaimGuard<'_>, signature: String) -> Result<SignatureOutcome, RequestError> {
    let outcome = SignatureOutcome {
        signature,
        signed_transaction: None,
    };
    guard.resolve(RequestOutcome::Signature(outcome.clone()))?;
    Ok(outcome)
}

fn check_signature(signature: &str) -> Result<(), String> {
    let bytes = hex::decode(signature).map_err(|e| format!("signature is not hex: {e}"))?;
    if SIGNATURE_LENGTHS.contains(&bytes.len()) {
        Ok(())
    } else {
        Err(format!("signature has unexpected length {}", bytes.len()))
    }
}
