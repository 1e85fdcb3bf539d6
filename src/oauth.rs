//! CSRF state around the adapters' OAuth calls.
use crate::adapters::ServiceAdapter;
use crate::model::{cred, CredentialPatch, Service};
use crate::store::CredentialStore;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// The service reported an error (user denied, bad client...).
    Denied(String),
    StateMismatch,
    MissingCode,
    ExchangeFailed,
}

impl CallbackError {
    /// Short flag carried on the redirect back to the admin page.
    pub fn flag(&self) -> &'static str {
        match self {
            CallbackError::Denied(_) => "denied",
            CallbackError::StateMismatch => "state_mismatch",
            CallbackError::MissingCode => "missing_code",
            CallbackError::ExchangeFailed => "exchange_failed",
        }
    }
}

#[derive(Clone)]
pub struct OAuthFlow {
    credentials: Arc<dyn CredentialStore>,
}

impl OAuthFlow {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Issues a fresh state and returns the adapter's authorization URL, or
    /// `None` when the service has no OAuth flow or no client id.
    pub async fn start(&self, adapter: &dyn ServiceAdapter) -> Result<Option<String>> {
        let state = Uuid::new_v4().simple().to_string();
        let Some(url) = adapter.auth_url(&state).await else {
            return Ok(None);
        };
        self.credentials
            .set(
                adapter.service(),
                CredentialPatch::default().set(cred::OAUTH_STATE, state),
            )
            .await?;
        Ok(Some(url))
    }

    /// Verifies state, then hands the code to the adapter. The state is
    /// single-use whatever the outcome.
    pub async fn finish(
        &self,
        adapter: &dyn ServiceAdapter,
        code: Option<&str>,
        state: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), CallbackError> {
        let service = adapter.service();
        if let Some(error) = error.filter(|e| !e.trim().is_empty()) {
            warn!(%service, %error, "oauth authorization denied");
            self.consume_state(service).await;
            return Err(CallbackError::Denied(error.to_string()));
        }
        let expected = match self.credentials.get(service).await {
            Ok(c) => c.get(cred::OAUTH_STATE).map(str::to_string),
            Err(err) => {
                warn!(?err, %service, "failed to read oauth state");
                None
            }
        };
        self.consume_state(service).await;
        match (expected.as_deref(), state) {
            (Some(expected), Some(got)) if expected == got => {}
            _ => {
                warn!(%service, "oauth state mismatch");
                return Err(CallbackError::StateMismatch);
            }
        }
        let code = code
            .filter(|c| !c.trim().is_empty())
            .ok_or(CallbackError::MissingCode)?;
        if adapter.handle_oauth_callback(code).await {
            info!(%service, "oauth callback completed");
            Ok(())
        } else {
            Err(CallbackError::ExchangeFailed)
        }
    }

    async fn consume_state(&self, service: Service) {
        let patch = CredentialPatch::default().remove(cred::OAUTH_STATE);
        if let Err(err) = self.credentials.set(service, patch).await {
            warn!(?err, %service, "failed to clear oauth state");
        }
    }
}
