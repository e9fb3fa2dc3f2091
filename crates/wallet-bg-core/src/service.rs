use std::sync::Arc;

use serde_json::{json, Value};

use crate::connection::ChainConnection;
use crate::domain::{
    AccountAuthType, AuthDecision, AuthorizeRequest, DerivationIndices, EvmConfirmationType,
    MetadataDef, NotificationMode, Rejection, RequestId, RequestOutcome, RequestPayload,
    SignRequest, SignatureOutcome,
};
use crate::popup::PopupCoordinator;
use crate::ports::{
    ActionBadgePort, AuthStorePort, ClockPort, EvmSignerPort, HardwareSignerPort,
    KeyringSignerPort, MetadataStorePort, PasswordGatePort, PortError,
};
use crate::queue::{PendingResponse, RequestQueueStore, Response};
use crate::requests::{
    route_rpc, AuthRequestHandler, AuthResolution, AuthorizeStep, ConfirmationOptions,
    EvmRequestHandler, MetadataRequestHandler, MetadataStep, RequestError, SubstrateSignHandler,
};

/// Entry point for every request that needs the user. Requester methods
/// queue and wait; resolver methods settle an entry and refresh the icon.
pub struct RequestService<A, M, B> {
    pub queue: Arc<RequestQueueStore>,
    pub popup: PopupCoordinator<B>,
    pub auth: AuthRequestHandler<A>,
    pub metadata: MetadataRequestHandler<M>,
    pub substrate: SubstrateSignHandler,
    pub evm: EvmRequestHandler,
}

impl<A, M, B> RequestService<A, M, B>
where
    A: AuthStorePort,
    M: MetadataStorePort,
    B: ActionBadgePort,
{
    pub fn new(
        auth_store: A,
        metadata_store: M,
        badge: B,
        clock: Arc<dyn ClockPort>,
        mode: NotificationMode,
    ) -> Self {
        let queue = Arc::new(RequestQueueStore::new());
        Self {
            popup: PopupCoordinator::new(badge, mode),
            auth: AuthRequestHandler::new(Arc::clone(&queue), auth_store, Arc::clone(&clock)),
            metadata: MetadataRequestHandler::new(
                Arc::clone(&queue),
                metadata_store,
                Arc::clone(&clock),
            ),
            substrate: SubstrateSignHandler::new(Arc::clone(&queue), Arc::clone(&clock)),
            evm: EvmRequestHandler::new(Arc::clone(&queue), clock),
            queue,
        }
    }

    pub fn num_all_requests(&self) -> usize {
        self.queue.num_all()
    }

    pub async fn update_icon(&self, should_close: bool) {
        if let Err(e) = self
            .popup
            .update_icon(self.num_all_requests(), should_close)
            .await
        {
            tracing::warn!(error = %e, "icon update failed");
        }
    }

    pub async fn authorize_url(
        &self,
        url: &str,
        request: AuthorizeRequest,
    ) -> Result<AuthDecision, RequestError> {
        match self.auth.authorize(url, request).await? {
            AuthorizeStep::Known(decision) => Ok(decision),
            AuthorizeStep::Pending(pending) => match self.surface(pending, false).await? {
                RequestOutcome::Auth(decision) => Ok(decision),
                other => Err(unexpected(other)),
            },
        }
    }

    pub async fn complete_auth(
        &self,
        id: &RequestId,
        resolution: AuthResolution,
    ) -> Result<(), RequestError> {
        self.auth.complete(id, resolution).await?;
        self.update_icon(true).await;
        Ok(())
    }

    /// `true` when the definition is (now) stored.
    pub async fn inject_metadata(&self, url: &str, def: MetadataDef) -> Result<bool, RequestError> {
        match self.metadata.inject(url, def).await? {
            MetadataStep::Known => Ok(true),
            MetadataStep::Pending(pending) => match self.surface(pending, false).await? {
                RequestOutcome::Metadata(accepted) => Ok(accepted),
                other => Err(unexpected(other)),
            },
        }
    }

    pub async fn approve_metadata(&self, id: &RequestId) -> Result<(), RequestError> {
        self.metadata.approve(id).await?;
        self.update_icon(true).await;
        Ok(())
    }

    pub async fn reject_metadata(&self, id: &RequestId) -> Result<(), RequestError> {
        self.metadata.reject(id)?;
        self.update_icon(true).await;
        Ok(())
    }

    pub async fn sign_substrate(
        &self,
        url: &str,
        request: SignRequest,
        chain: Option<&ChainConnection>,
    ) -> Result<SignatureOutcome, RequestError> {
        let pending = self.substrate.sign(url, request, None, chain)?;
        match self.surface(pending, false).await? {
            RequestOutcome::Signature(signature) => Ok(signature),
            other => Err(unexpected(other)),
        }
    }

    pub async fn approve_sign_password(
        &self,
        id: &RequestId,
        password: &str,
        gate: &dyn PasswordGatePort,
        signer: &dyn KeyringSignerPort,
    ) -> Result<SignatureOutcome, RequestError> {
        let outcome = self
            .substrate
            .approve_with_password(id, password, gate, signer)
            .await?;
        self.update_icon(true).await;
        Ok(outcome)
    }

    pub async fn approve_sign_hardware(
        &self,
        id: &RequestId,
        device: &dyn HardwareSignerPort,
        indices: DerivationIndices,
    ) -> Result<SignatureOutcome, RequestError> {
        let outcome = self
            .substrate
            .approve_with_hardware(id, device, indices)
            .await?;
        self.update_icon(true).await;
        Ok(outcome)
    }

    pub async fn approve_sign_qr(
        &self,
        id: &RequestId,
        signature: &str,
    ) -> Result<SignatureOutcome, RequestError> {
        let outcome = self.substrate.approve_with_qr(id, signature)?;
        self.update_icon(true).await;
        Ok(outcome)
    }

    pub async fn cancel_sign(&self, id: &RequestId) -> Result<(), RequestError> {
        self.substrate.cancel(id)?;
        self.update_icon(true).await;
        Ok(())
    }

    /// Handles a dApp RPC call that needs confirmation. Account requests
    /// from an origin that already granted EVM accounts answer immediately.
    pub async fn evm_request(
        &self,
        url: &str,
        method: &str,
        params: Value,
        tab_id: Option<u32>,
    ) -> Result<Value, RequestError> {
        let (confirmation_type, payload) = route_rpc(method, &params)?;
        if confirmation_type == EvmConfirmationType::RequestAccounts {
            if let Some(accounts) = self.auth.known_accounts(url, AccountAuthType::Evm).await? {
                return Ok(json!(accounts));
            }
        }
        let pending = self.evm.add_confirmation(
            url,
            confirmation_type,
            payload,
            ConfirmationOptions {
                tab_id,
                ..ConfirmationOptions::default()
            },
        )?;
        let internal = self.evm.is_internal(url);
        match self.surface(pending, internal).await? {
            RequestOutcome::Evm(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Completes an EVM confirmation. Approving an account request also
    /// records the granted accounts for the origin, while the entry is
    /// still claimed and only when the resolution will be accepted.
    pub async fn complete_evm(
        &self,
        id: &RequestId,
        result: Value,
        signer: Option<&dyn EvmSignerPort>,
    ) -> Result<Value, RequestError> {
        let (guard, value) = self.evm.prepare_completion(id, result, signer).await?;
        let outcome = RequestOutcome::Evm(value.clone());
        if is_account_request(&guard.entry().payload) && guard.validate(&outcome).is_ok() {
            let accounts: Vec<String> = value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|a| a.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            if !accounts.is_empty() {
                let url = guard.entry().url.clone();
                self.auth
                    .grant(&url, &url, AccountAuthType::Evm, &accounts)
                    .await?;
            }
        }
        guard.resolve(outcome)?;
        self.update_icon(true).await;
        Ok(value)
    }

    pub async fn reject_evm(&self, id: &RequestId) -> Result<(), RequestError> {
        self.evm.reject_confirmation(id)?;
        self.update_icon(true).await;
        Ok(())
    }

    /// Rejects everything pending and forgets every authorized site.
    pub async fn reset_wallet(&self) -> Result<usize, RequestError> {
        let mut rejected = self.auth.reset().await?;
        rejected += self.evm.reset()?;
        rejected += self.queue.reject_all(Rejection::reset())?;
        self.update_icon(true).await;
        tracing::info!(rejected, "wallet reset");
        Ok(rejected)
    }

    async fn surface(
        &self,
        pending: PendingResponse,
        internal: bool,
    ) -> Result<RequestOutcome, RequestError> {
        if internal {
            if let Err(e) = self.popup.refresh_badge(self.num_all_requests()).await {
                tracing::warn!(error = %e, "badge update failed");
            }
        } else {
            self.update_icon(false).await;
        }
        into_outcome(pending.wait().await)
    }
}

fn into_outcome(response: Response) -> Result<RequestOutcome, RequestError> {
    response.map_err(RequestError::Rejected)
}

fn unexpected(outcome: RequestOutcome) -> RequestError {
    PortError::Validation(format!("unexpected resolution {outcome:?}")).into()
}

fn is_account_request(payload: &RequestPayload) -> bool {
    matches!(
        payload,
        RequestPayload::Evm(confirmation)
            if confirmation.confirmation_type == EvmConfirmationType::RequestAccounts
    )
}
