use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::domain::{
    QueueEntry, Rejection, RequestId, RequestKind, RequestOutcome, RequestPayload,
};

/// What a requester eventually receives.
pub type Response = Result<RequestOutcome, Rejection>;

/// Checks a resolution value before it reaches the requester.
pub type Validator = Box<dyn Fn(&RequestOutcome) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("duplicate request id: {0}")]
    DuplicateId(RequestId),
    #[error("unknown request id: {0}")]
    UnknownId(RequestId),
    #[error("request {0} is already being resolved")]
    ResolutionInFlight(RequestId),
    #[error("resolution of {id} rejected by validator: {reason}")]
    ValidatorRejected { id: RequestId, reason: String },
    #[error("payload of kind {actual} cannot replace a {expected} request")]
    KindMismatch {
        expected: RequestKind,
        actual: RequestKind,
    },
    #[error("request queue lock poisoned")]
    Poisoned,
}

/// Requester side of one queue entry.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub async fn wait(self) -> Response {
        self.rx.await.unwrap_or_else(|_| Err(Rejection::dropped()))
    }
}

struct Record {
    entry: QueueEntry,
    validator: Option<Validator>,
    waiters: Vec<oneshot::Sender<Response>>,
    in_flight: bool,
}

#[derive(Default)]
struct QueueState {
    order: [Vec<RequestId>; 4],
    records: HashMap<RequestId, Record>,
}

/// Pending requests bucketed by kind, in arrival order.
pub struct RequestQueueStore {
    state: Mutex<QueueState>,
    counters: [AtomicUsize; 4],
    snapshots: [watch::Sender<Vec<QueueEntry>>; 4],
}

impl Default for RequestQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueueStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            counters: std::array::from_fn(|_| AtomicUsize::new(0)),
            snapshots: std::array::from_fn(|_| watch::channel(Vec::new()).0),
        }
    }

    pub fn enqueue(
        &self,
        entry: QueueEntry,
        validator: Option<Validator>,
    ) -> Result<PendingResponse, QueueError> {
        let mut state = self.lock()?;
        if state.records.contains_key(&entry.id) {
            return Err(QueueError::DuplicateId(entry.id));
        }
        let (tx, rx) = oneshot::channel();
        let id = entry.id.clone();
        let kind = entry.kind;
        state.order[kind.index()].push(id.clone());
        state.records.insert(
            id.clone(),
            Record {
                entry,
                validator,
                waiters: vec![tx],
                in_flight: false,
            },
        );
        self.counters[kind.index()].fetch_add(1, Ordering::SeqCst);
        self.publish(&state, kind);
        tracing::debug!(request_id = %id, kind = %kind, "request enqueued");
        Ok(PendingResponse { id, rx })
    }

    /// Adds another requester to a pending entry; it receives the same result.
    pub fn attach(&self, id: &RequestId) -> Result<PendingResponse, QueueError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownId(id.clone()))?;
        let (tx, rx) = oneshot::channel();
        record.waiters.push(tx);
        Ok(PendingResponse { id: id.clone(), rx })
    }

    pub fn update_payload(&self, id: &RequestId, payload: RequestPayload) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownId(id.clone()))?;
        if record.entry.kind != payload.kind() {
            return Err(QueueError::KindMismatch {
                expected: record.entry.kind,
                actual: payload.kind(),
            });
        }
        record.entry.payload = payload;
        let kind = record.entry.kind;
        self.publish(&state, kind);
        Ok(())
    }

    pub fn resolve(&self, id: &RequestId, outcome: RequestOutcome) -> Result<(), QueueError> {
        self.finish(id, Ok(outcome), false)
    }

    pub fn reject(&self, id: &RequestId, rejection: Rejection) -> Result<(), QueueError> {
        self.finish(id, Err(rejection), false)
    }

    /// Marks an entry in flight so no other path can resolve it until the
    /// guard completes it or is dropped.
    pub fn claim(&self, id: &RequestId) -> Result<ClaimGuard<'_>, QueueError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| QueueError::UnknownId(id.clone()))?;
        if record.in_flight {
            return Err(QueueError::ResolutionInFlight(id.clone()));
        }
        record.in_flight = true;
        Ok(ClaimGuard {
            store: self,
            entry: record.entry.clone(),
            done: false,
        })
    }

    pub fn get(&self, id: &RequestId) -> Option<QueueEntry> {
        self.lock()
            .ok()
            .and_then(|state| state.records.get(id).map(|r| r.entry.clone()))
    }

    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.lock()
            .ok()
            .and_then(|state| state.records.get(id).map(|r| r.in_flight))
            .unwrap_or(false)
    }

    /// Pending entries of `kind` matching `predicate`, in arrival order.
    pub fn find<F>(&self, kind: RequestKind, predicate: F) -> Vec<QueueEntry>
    where
        F: Fn(&QueueEntry) -> bool,
    {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        state.order[kind.index()]
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|r| &r.entry)
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, kind: RequestKind) -> Vec<QueueEntry> {
        self.snapshots[kind.index()].borrow().clone()
    }

    pub fn subscribe(&self, kind: RequestKind) -> watch::Receiver<Vec<QueueEntry>> {
        self.snapshots[kind.index()].subscribe()
    }

    pub fn num_pending(&self, kind: RequestKind) -> usize {
        self.counters[kind.index()].load(Ordering::SeqCst)
    }

    pub fn num_all(&self) -> usize {
        RequestKind::ALL
            .iter()
            .map(|kind| self.num_pending(*kind))
            .sum()
    }

    /// Rejects every pending entry of `kind`. Returns how many were dropped.
    pub fn reject_kind(&self, kind: RequestKind, rejection: Rejection) -> Result<usize, QueueError> {
        let drained = {
            let mut state = self.lock()?;
            let ids = std::mem::take(&mut state.order[kind.index()]);
            let drained: Vec<Record> = ids
                .iter()
                .filter_map(|id| state.records.remove(id))
                .collect();
            self.counters[kind.index()].store(0, Ordering::SeqCst);
            self.publish(&state, kind);
            drained
        };
        let count = drained.len();
        for record in drained {
            deliver(record.waiters, Err(rejection.clone()));
        }
        Ok(count)
    }

    pub fn reject_all(&self, rejection: Rejection) -> Result<usize, QueueError> {
        let mut total = 0;
        for kind in RequestKind::ALL {
            total += self.reject_kind(kind, rejection.clone())?;
        }
        Ok(total)
    }

    fn finish(&self, id: &RequestId, response: Response, claimed: bool) -> Result<(), QueueError> {
        let record = {
            let mut state = self.lock()?;
            let record = state
                .records
                .get(id)
                .ok_or_else(|| QueueError::UnknownId(id.clone()))?;
            if record.in_flight && !claimed {
                return Err(QueueError::ResolutionInFlight(id.clone()));
            }
            let Some(record) = state.records.remove(id) else {
                return Err(QueueError::UnknownId(id.clone()));
            };
            let kind = record.entry.kind;
            state.order[kind.index()].retain(|queued| queued != id);
            self.counters[kind.index()].fetch_sub(1, Ordering::SeqCst);
            self.publish(&state, kind);
            record
        };

        let response = match (&response, &record.validator) {
            (Ok(outcome), Some(validator)) => match validator(outcome) {
                Ok(()) => response,
                Err(reason) => {
                    tracing::warn!(request_id = %id, reason = %reason, "resolution rejected by validator");
                    deliver(record.waiters, Err(Rejection::validator(reason.clone())));
                    return Err(QueueError::ValidatorRejected {
                        id: id.clone(),
                        reason,
                    });
                }
            },
            _ => response,
        };
        tracing::debug!(
            request_id = %id,
            kind = %record.entry.kind,
            resolved = response.is_ok(),
            "request settled"
        );
        deliver(record.waiters, response);
        Ok(())
    }

    fn release(&self, id: &RequestId) {
        if let Ok(mut state) = self.lock() {
            if let Some(record) = state.records.get_mut(id) {
                record.in_flight = false;
            }
        }
    }

    fn publish(&self, state: &QueueState, kind: RequestKind) {
        let snapshot: Vec<QueueEntry> = state.order[kind.index()]
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|r| r.entry.clone())
            .collect();
        self.snapshots[kind.index()].send_replace(snapshot);
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }
}

fn deliver(waiters: Vec<oneshot::Sender<Response>>, response: Response) {
    for waiter in waiters {
        // A requester that went away no longer needs the answer.
        let _ = waiter.send(response.clone());
    }
}

/// Exclusive right to complete one entry. Dropping it without completing
/// leaves the entry pending for another attempt.
pub struct ClaimGuard<'a> {
    store: &'a RequestQueueStore,
    entry: QueueEntry,
    done: bool,
}

impl ClaimGuard<'_> {
    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    pub fn id(&self) -> &RequestId {
        &self.entry.id
    }

    /// Runs the entry's validator on `outcome` without settling anything.
    pub fn validate(&self, outcome: &RequestOutcome) -> Result<(), QueueError> {
        let state = self.store.lock()?;
        let record = state
            .records
            .get(&self.entry.id)
            .ok_or_else(|| QueueError::UnknownId(self.entry.id.clone()))?;
        match &record.validator {
            Some(validator) => validator(outcome).map_err(|reason| QueueError::ValidatorRejected {
                id: self.entry.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn resolve(mut self, outcome: RequestOutcome) -> Result<(), QueueError> {
        self.done = true;
        self.store.finish(&self.entry.id, Ok(outcome), true)
    }

    pub fn reject(mut self, rejection: Rejection) -> Result<(), QueueError> {
        self.done = true;
        self.store.finish(&self.entry.id, Err(rejection), true)
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::debug!(request_id = %self.entry.id, "claim released, request stays pending");
            self.store.release(&self.entry.id);
        }
    }
}
