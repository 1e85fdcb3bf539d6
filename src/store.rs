//! Collaborator interfaces for record and credential persistence.
use crate::model::{
    cred, Credential, CredentialPatch, Fields, Kind, NewRecord, ReactionRecord, Service, Status,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Result of a status write, carrying what the status was before.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: Status,
    pub record: ReactionRecord,
}

impl StatusChange {
    /// A genuine transition into `published`; re-saving a published record is not one.
    pub fn entered_published(&self) -> bool {
        self.previous != Status::Published && self.record.status == Status::Published
    }
}

/// Bounds for fuzzy duplicate lookups.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub at: DateTime<Utc>,
    pub radius: Duration,
}

impl TimeWindow {
    pub fn around(at: DateTime<Utc>, radius: Duration) -> Self {
        Self { at, radius }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.at - self.radius
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.at + self.radius
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ReactionRecord>>;

    async fn create(&self, record: NewRecord) -> Result<ReactionRecord>;

    /// Merges `partial` into the record's fields; other fields are untouched.
    async fn update_fields(&self, id: &str, partial: &Fields) -> Result<()>;

    async fn set_status(&self, id: &str, status: Status) -> Result<StatusChange>;

    /// Stores the external id for `service` unless one is already present.
    /// Returns false when the record already had one.
    async fn record_syndication(
        &self,
        id: &str,
        service: Service,
        external_id: &str,
        url: Option<&str>,
    ) -> Result<bool>;

    async fn find_by_external_id(
        &self,
        service: Service,
        external_id: &str,
    ) -> Result<Option<ReactionRecord>>;

    /// Finds a record of `kind` whose `field` is name-equivalent to `value` inside `window`.
    /// With `unlinked_to`, records already carrying an external id for that
    /// service are skipped: they are a different item on that service.
    async fn find_by_field_near(
        &self,
        kind: Kind,
        field: &str,
        value: &str,
        window: TimeWindow,
        unlinked_to: Option<Service>,
    ) -> Result<Option<ReactionRecord>>;

    /// Finds a record of `kind` within `radius_degrees` of (lat, lon) inside `window`.
    async fn find_near(
        &self,
        kind: Kind,
        lat: f64,
        lon: f64,
        radius_degrees: f64,
        window: TimeWindow,
    ) -> Result<Option<ReactionRecord>>;

    /// Bumps the failure counter for (record, service); returns the new count.
    async fn record_failed_attempt(&self, id: &str, service: Service, error: &str)
        -> Result<u32>;

    async fn failed_attempts(&self, id: &str, service: Service) -> Result<u32>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, service: Service) -> Result<Credential>;

    async fn set(&self, service: Service, patch: CredentialPatch) -> Result<()>;

    /// Removes rotating token material for `service` only.
    async fn clear_tokens(&self, service: Service) -> Result<()> {
        let patch = cred::TOKEN_KEYS
            .iter()
            .fold(CredentialPatch::default(), |p, key| p.remove(key));
        self.set(service, patch).await
    }
}

/// Normalises a display name for fuzzy equivalence: case, punctuation and
/// whitespace runs are ignored.
pub fn name_key(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
