//! Service adapters: one per external system, each knowing that system's wire
//! protocol. Adapters never retry and never let a failure escape as anything
//! but a [`SyncError`].

pub mod foursquare;
pub mod lastfm;
pub mod owntracks;
pub mod trakt;
pub mod untappd;

use crate::error::SyncError;
use crate::model::{Credential, CredentialPatch, Fields, NewRecord, ReactionRecord, Service};
use crate::store::CredentialStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One item read from a service's history, before mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalItem {
    pub service: Service,
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    pub url: Option<String>,
    pub payload: Value,
}

/// A successful syndication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Syndicated {
    pub external_id: String,
    pub url: Option<String>,
    /// Identifiers the adapter resolved along the way (venue id, beer id) so
    /// later calls can skip the lookup.
    pub resolved: Fields,
}

#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn service(&self) -> Service;

    /// True iff the credentials needed to call the service are present.
    async fn is_connected(&self) -> bool;

    /// OAuth authorization URL carrying `state`; `None` for non-OAuth services.
    async fn auth_url(&self, state: &str) -> Option<String>;

    /// Exchanges an authorization code and persists the tokens. False on any failure.
    async fn handle_oauth_callback(&self, code: &str) -> bool;

    async fn syndicate(&self, record: &ReactionRecord) -> Result<Syndicated, SyncError>;

    /// Newest-first history, at most `limit` items.
    async fn fetch_recent_items(&self, limit: usize) -> Result<Vec<ExternalItem>, SyncError>;

    /// Pure mapping from a history item to a new record.
    fn to_record(&self, item: &ExternalItem) -> Result<NewRecord, SyncError>;
}

/// What every adapter needs from its surroundings.
#[derive(Clone)]
pub struct AdapterContext {
    pub http: Client,
    pub credentials: Arc<dyn CredentialStore>,
    /// Base URL that OAuth callbacks are served under.
    pub public_url: Url,
}

impl AdapterContext {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        public_url: Url,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            credentials,
            public_url,
        })
    }

    /// `{public_url}/oauth/{service}/callback`
    pub fn redirect_uri(&self, service: Service) -> String {
        let mut base = self.public_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(&format!("oauth/{}/callback", service.as_str()))
            .map(|u| u.to_string())
            .unwrap_or_default()
    }

    pub async fn credential(&self, service: Service) -> Result<Credential, SyncError> {
        Ok(self.credentials.get(service).await?)
    }

    /// Reads the credential, mapping storage errors to "not connected".
    pub async fn credential_or_default(&self, service: Service) -> Credential {
        match self.credentials.get(service).await {
            Ok(c) => c,
            Err(err) => {
                warn!(%service, ?err, "failed to read credentials");
                Credential::default()
            }
        }
    }

    pub async fn save(&self, service: Service, patch: CredentialPatch) -> Result<(), SyncError> {
        Ok(self.credentials.set(service, patch).await?)
    }
}

/// Shared HTTP client. Every external call goes through this and so carries
/// the configured timeout.
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent("reaction-sync/0.1")
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .context("failed to build HTTP client")
}

pub fn parse_base(url: &str) -> Url {
    Url::parse(url).expect("valid built-in base URL")
}

/// Fails non-2xx responses with a classified error.
pub async fn check_status(res: Response) -> Result<Response, SyncError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(SyncError::from_status(status, &body))
}

/// Reads a successful JSON body.
pub async fn read_json<T: DeserializeOwned>(res: Response) -> Result<T, SyncError> {
    let res = check_status(res).await?;
    let text = res.text().await?;
    Ok(serde_json::from_str(&text)?)
}

/// Deterministic id for services whose responses carry none. Parts are
/// joined with a separator that cannot appear after trimming.
pub fn synthesize_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.trim().to_lowercase().as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

/// String form of a JSON scalar; numbers are common where ids are expected.
pub fn json_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
