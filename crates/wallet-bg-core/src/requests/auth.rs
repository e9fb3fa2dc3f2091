use std::sync::Arc;

use url::Url;

use crate::domain::{
    AccountAuthType, AuthDecision, AuthPayload, AuthUrlEntry, AuthUrls, AuthorizeRequest,
    QueueEntry, Rejection, RequestId, RequestKind, RequestOutcome, RequestPayload, TimestampMs,
};
use crate::ports::{AuthStorePort, ClockPort, PortError};
use crate::queue::{PendingResponse, QueueError, RequestQueueStore};

use super::RequestError;

/// Result of an authorization request: answered from the stored record, or
/// waiting on the user.
#[derive(Debug)]
pub enum AuthorizeStep {
    Known(AuthDecision),
    Pending(PendingResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResolution {
    Approve(Vec<String>),
    Deny,
    Cancel,
}

pub struct AuthRequestHandler<S> {
    queue: Arc<RequestQueueStore>,
    store: S,
    clock: Arc<dyn ClockPort>,
    urls: tokio::sync::Mutex<Option<AuthUrls>>,
}

impl<S: AuthStorePort> AuthRequestHandler<S> {
    pub fn new(queue: Arc<RequestQueueStore>, store: S, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            queue,
            store,
            clock,
            urls: tokio::sync::Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn auth_list(&self) -> Result<AuthUrls, RequestError> {
        let mut cached = self.urls.lock().await;
        Ok(self.loaded(&mut cached).await?.clone())
    }

    /// Answers from the stored record when the origin already granted
    /// accounts of the requested type, rejects blocked origins, and queues
    /// everything else. A second request from an origin with one already
    /// pending joins that entry.
    pub async fn authorize(
        &self,
        url: &str,
        mut request: AuthorizeRequest,
    ) -> Result<AuthorizeStep, RequestError> {
        let id_str = strip_url(url)?;
        let mut cached = self.urls.lock().await;
        let existing = self.loaded(&mut cached).await?.get(&id_str).cloned();

        if let Some(entry) = &existing {
            if !entry.is_allowed {
                tracing::warn!(origin = %id_str, "blocked origin requested authorization");
                return Err(RequestError::Policy(format!(
                    "The source {url} is not allowed to interact with this extension"
                )));
            }
            let accounts = entry.allowed_accounts(request.account_auth_type);
            if !request.reconfirm
                && entry.account_auth_type.covers(request.account_auth_type)
                && !accounts.is_empty()
            {
                return Ok(AuthorizeStep::Known(AuthDecision {
                    approved: true,
                    accounts,
                }));
            }
        }

        let pending = self.queue.find(RequestKind::Auth, |entry| {
            matches!(&entry.payload, RequestPayload::Auth(p) if p.id_str == id_str)
        });
        if let Some(entry) = pending.into_iter().next() {
            if let RequestPayload::Auth(mut payload) = entry.payload {
                let merged = payload
                    .request
                    .account_auth_type
                    .merge(request.account_auth_type);
                if merged != payload.request.account_auth_type {
                    payload.request.account_auth_type = merged;
                    self.queue
                        .update_payload(&entry.id, RequestPayload::Auth(payload))?;
                }
            }
            tracing::debug!(origin = %id_str, request_id = %entry.id, "merged into pending authorization");
            return Ok(AuthorizeStep::Pending(self.queue.attach(&entry.id)?));
        }

        if let Some(entry) = &existing {
            request.allowed_accounts = entry.allowed_accounts(request.account_auth_type);
        }
        let mut queued = QueueEntry::new(
            RequestId::generate(),
            url,
            RequestPayload::Auth(AuthPayload {
                id_str: id_str.clone(),
                request,
            }),
        );
        queued.created_at_ms = TimestampMs(self.clock.now_ms()?);
        tracing::info!(origin = %id_str, request_id = %queued.id, "authorization queued");
        Ok(AuthorizeStep::Pending(self.queue.enqueue(queued, None)?))
    }

    /// Stores the user's answer, then settles the queue entry. A failed
    /// store write leaves the entry pending. Cancelling stores nothing.
    pub async fn complete(
        &self,
        id: &RequestId,
        resolution: AuthResolution,
    ) -> Result<(), RequestError> {
        let guard = self.queue.claim(id)?;
        let RequestPayload::Auth(payload) = guard.entry().payload.clone() else {
            return Err(QueueError::KindMismatch {
                expected: RequestKind::Auth,
                actual: guard.entry().kind,
            }
            .into());
        };
        let (approved, accounts) = match resolution {
            AuthResolution::Cancel => {
                guard.reject(Rejection::cancelled())?;
                return Ok(());
            }
            AuthResolution::Deny => (false, Vec::new()),
            AuthResolution::Approve(accounts) => (true, accounts),
        };
        let url = guard.entry().url.clone();
        let decision = self
            .record_decision(
                &url,
                &payload.id_str,
                &payload.request.origin,
                payload.request.account_auth_type,
                approved,
                &accounts,
            )
            .await?;
        guard.resolve(RequestOutcome::Auth(decision))?;
        Ok(())
    }

    /// Writes an authorization record for `url` outside the queue flow.
    pub async fn grant(
        &self,
        url: &str,
        origin: &str,
        account_auth_type: AccountAuthType,
        accounts: &[String],
    ) -> Result<AuthDecision, RequestError> {
        let id_str = strip_url(url)?;
        self.record_decision(url, &id_str, origin, account_auth_type, true, accounts)
            .await
    }

    /// Accounts of `account_auth_type` the origin already granted, if any.
    /// Blocked origins are an error.
    pub async fn known_accounts(
        &self,
        url: &str,
        account_auth_type: AccountAuthType,
    ) -> Result<Option<Vec<String>>, RequestError> {
        let id_str = strip_url(url)?;
        let mut cached = self.urls.lock().await;
        match self.loaded(&mut cached).await?.get(&id_str) {
            None => Ok(None),
            Some(entry) if !entry.is_allowed => Err(RequestError::Policy(format!(
                "The source {url} is not allowed to interact with this extension"
            ))),
            Some(entry) => {
                let accounts = entry.allowed_accounts(account_auth_type);
                Ok((!accounts.is_empty()).then_some(accounts))
            }
        }
    }

    pub async fn ensure_url_authorized(&self, url: &str) -> Result<(), RequestError> {
        let id_str = strip_url(url)?;
        let mut cached = self.urls.lock().await;
        match self.loaded(&mut cached).await?.get(&id_str) {
            None => Err(RequestError::Policy(format!(
                "The source {url} has not been enabled yet"
            ))),
            Some(entry) if !entry.is_allowed => Err(RequestError::Policy(format!(
                "The source {url} is not allowed to interact with this extension"
            ))),
            Some(_) => Ok(()),
        }
    }

    pub async fn toggle_authorization(&self, url: &str) -> Result<AuthUrls, RequestError> {
        let id_str = strip_url(url)?;
        self.mutate(|urls| {
            let entry = urls
                .get_mut(&id_str)
                .ok_or_else(|| PortError::NotFound(format!("no authorization for {id_str}")))?;
            entry.is_allowed = !entry.is_allowed;
            Ok(())
        })
        .await
    }

    pub async fn forget_site(&self, url: &str) -> Result<AuthUrls, RequestError> {
        let id_str = strip_url(url)?;
        self.mutate(|urls| {
            urls.remove(&id_str);
            Ok(())
        })
        .await
    }

    /// Rejects pending authorizations and clears every stored record.
    pub async fn reset(&self) -> Result<usize, RequestError> {
        let rejected = self.queue.reject_kind(RequestKind::Auth, Rejection::reset())?;
        self.mutate(|urls| {
            urls.clear();
            Ok(())
        })
        .await?;
        Ok(rejected)
    }

    async fn record_decision(
        &self,
        url: &str,
        id_str: &str,
        origin: &str,
        account_auth_type: AccountAuthType,
        approved: bool,
        accounts: &[String],
    ) -> Result<AuthDecision, RequestError> {
        let now = TimestampMs(self.clock.now_ms()?);
        let mut cached = self.urls.lock().await;
        let urls = self.loaded(&mut cached).await?;
        let mut next = urls.clone();
        let previous = next.get(id_str).cloned();

        let mut is_allowed_map = previous
            .as_ref()
            .map(|p| p.is_allowed_map.clone())
            .unwrap_or_default();
        // Accounts of the other type keep their earlier grant.
        for (address, allowed) in is_allowed_map.iter_mut() {
            if account_auth_type.accepts(address) {
                *allowed = false;
            }
        }
        for address in accounts {
            is_allowed_map.insert(address.clone(), approved);
        }

        let entry = AuthUrlEntry {
            id: id_str.to_owned(),
            origin: origin.to_owned(),
            url: url.to_owned(),
            is_allowed: approved,
            is_allowed_map,
            account_auth_type: previous
                .as_ref()
                .map(|p| p.account_auth_type.merge(account_auth_type))
                .unwrap_or(account_auth_type),
            last_auth_ms: now,
            count: previous.as_ref().map(|p| p.count).unwrap_or_default() + 1,
            current_evm_network: previous.and_then(|p| p.current_evm_network),
        };
        let decision = AuthDecision {
            approved,
            accounts: entry.allowed_accounts(account_auth_type),
        };
        next.insert(id_str.to_owned(), entry);
        self.store.save(&next).await?;
        *urls = next;
        tracing::info!(origin = %id_str, approved, "authorization recorded");
        Ok(decision)
    }

    async fn mutate<F>(&self, change: F) -> Result<AuthUrls, RequestError>
    where
        F: FnOnce(&mut AuthUrls) -> Result<(), PortError>,
    {
        let mut cached = self.urls.lock().await;
        let urls = self.loaded(&mut cached).await?;
        let mut next = urls.clone();
        change(&mut next)?;
        self.store.save(&next).await?;
        *urls = next.clone();
        Ok(next)
    }

    async fn loaded<'a>(
        &self,
        cached: &'a mut Option<AuthUrls>,
    ) -> Result<&'a mut AuthUrls, PortError> {
        if cached.is_none() {
            *cached = Some(self.store.load().await?);
        }
        Ok(cached.get_or_insert_with(AuthUrls::new))
    }
}

/// Key an origin is filed under: the host (and port) of its URL.
pub fn strip_url(url: &str) -> Result<String, RequestError> {
    let parsed =
        Url::parse(url).map_err(|e| RequestError::InvalidParams(format!("invalid url {url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" | "ipfs" | "ipns" => {}
        other => {
            return Err(RequestError::InvalidParams(format!(
                "unsupported scheme {other} in {url}"
            )))
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| RequestError::InvalidParams(format!("url {url} has no host")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}
