use std::sync::Arc;

use crate::domain::{
    MetadataDef, QueueEntry, Rejection, RequestId, RequestKind, RequestOutcome, RequestPayload,
    TimestampMs,
};
use crate::ports::{ClockPort, MetadataStorePort};
use crate::queue::{PendingResponse, QueueError, RequestQueueStore};

use super::RequestError;

#[derive(Debug)]
pub enum MetadataStep {
    /// A definition with the same or a newer spec version is already stored.
    Known,
    Pending(PendingResponse),
}

pub struct MetadataRequestHandler<S> {
    queue: Arc<RequestQueueStore>,
    store: S,
    clock: Arc<dyn ClockPort>,
}

impl<S: MetadataStorePort> MetadataRequestHandler<S> {
    pub fn new(queue: Arc<RequestQueueStore>, store: S, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            queue,
            store,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Queues `def` for approval unless a definition at least as new is
    /// stored. An identical pending definition is joined, not duplicated.
    pub async fn inject(&self, url: &str, def: MetadataDef) -> Result<MetadataStep, RequestError> {
        if let Some(known) = self.store.get(&def.genesis_hash).await? {
            if def.spec_version <= known.spec_version {
                tracing::debug!(
                    chain = %def.chain,
                    offered = def.spec_version,
                    stored = known.spec_version,
                    "metadata already up to date"
                );
                return Ok(MetadataStep::Known);
            }
        }

        let pending = self.queue.find(RequestKind::Metadata, |entry| {
            matches!(
                &entry.payload,
                RequestPayload::Metadata(p)
                    if p.genesis_hash == def.genesis_hash && p.spec_version == def.spec_version
            )
        });
        if let Some(entry) = pending.first() {
            return Ok(MetadataStep::Pending(self.queue.attach(&entry.id)?));
        }

        let mut queued = QueueEntry::new(RequestId::generate(), url, RequestPayload::Metadata(def));
        queued.created_at_ms = TimestampMs(self.clock.now_ms()?);
        tracing::info!(request_id = %queued.id, url, "metadata update queued");
        Ok(MetadataStep::Pending(self.queue.enqueue(queued, None)?))
    }

    /// Persists the definition, then resolves. A failed write leaves the
    /// request pending. A definition no newer than the stored one resolves
    /// without writing, and approving one settles the pending entries it
    /// supersedes.
    pub async fn approve(&self, id: &RequestId) -> Result<(), RequestError> {
        let guard = self.queue.claim(id)?;
        let RequestPayload::Metadata(def) = guard.entry().payload.clone() else {
            return Err(QueueError::KindMismatch {
                expected: RequestKind::Metadata,
                actual: guard.entry().kind,
            }
            .into());
        };
        if let Some(known) = self.store.get(&def.genesis_hash).await? {
            if known.spec_version >= def.spec_version {
                tracing::info!(
                    chain = %def.chain,
                    offered = def.spec_version,
                    stored = known.spec_version,
                    "approved metadata already superseded"
                );
                guard.resolve(RequestOutcome::Metadata(true))?;
                return Ok(());
            }
        }
        self.store.put(&def).await?;
        tracing::info!(chain = %def.chain, spec_version = def.spec_version, "metadata stored");
        guard.resolve(RequestOutcome::Metadata(true))?;
        self.settle_superseded(&def);
        Ok(())
    }

    fn settle_superseded(&self, stored: &MetadataDef) {
        let superseded = self.queue.find(RequestKind::Metadata, |entry| {
            matches!(
                &entry.payload,
                RequestPayload::Metadata(p)
                    if p.genesis_hash == stored.genesis_hash
                        && p.spec_version <= stored.spec_version
            )
        });
        for entry in superseded {
            if let Err(e) = self.queue.resolve(&entry.id, RequestOutcome::Metadata(true)) {
                tracing::debug!(request_id = %entry.id, error = %e, "superseded metadata left pending");
            }
        }
    }

    pub fn reject(&self, id: &RequestId) -> Result<(), RequestError> {
        self.queue.reject(id, Rejection::rejected("Rejected"))?;
        Ok(())
    }

    pub async fn known_metadata(&self) -> Result<Vec<MetadataDef>, RequestError> {
        Ok(self.store.all().await?)
    }
}
