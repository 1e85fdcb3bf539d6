//! Sync engines: one generic engine, specialised per content kind by a
//! [`KindPolicy`], paired with one service adapter.
use crate::adapters::{ExternalItem, ServiceAdapter};
use crate::error::SyncError;
use crate::model::{
    field, ExternalRef, ImportResult, Kind, NewRecord, ReactionRecord, Service, Status,
};
use crate::store::{ContentStore, TimeWindow};
use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What differs between checkins, listens and watches.
pub trait KindPolicy: Send + Sync + 'static {
    fn kind(&self) -> Kind;

    /// Minimum fields `service` needs to accept a syndication of `record`.
    fn has_required_fields(&self, record: &ReactionRecord, service: Service) -> bool;

    /// Field used for name-in-window duplicate detection on import from
    /// `service`, if any.
    fn fuzzy_key<'a>(
        &self,
        _record: &'a NewRecord,
        _service: Service,
    ) -> Option<(&'static str, &'a str)> {
        None
    }

    /// Normalises an imported record before it is stored.
    fn prepare_import(&self, _record: &mut NewRecord) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckinPolicy;

impl KindPolicy for CheckinPolicy {
    fn kind(&self) -> Kind {
        Kind::Checkin
    }

    fn has_required_fields(&self, record: &ReactionRecord, service: Service) -> bool {
        match service {
            Service::Untappd => {
                record.field(field::BEER_NAME).is_some()
                    || record.field(field::UNTAPPD_BEER_ID).is_some()
            }
            _ => {
                record.field(field::FOURSQUARE_VENUE_ID).is_some()
                    || (record.field(field::VENUE_NAME).is_some()
                        && record.coordinates().is_some())
            }
        }
    }

    fn fuzzy_key<'a>(
        &self,
        record: &'a NewRecord,
        service: Service,
    ) -> Option<(&'static str, &'a str)> {
        let venue = || record.field(field::VENUE_NAME).map(|v| (field::VENUE_NAME, v));
        let beer = || record.field(field::BEER_NAME).map(|v| (field::BEER_NAME, v));
        // A flight is several beers at one venue.
        match service {
            Service::Untappd => beer().or_else(venue),
            _ => venue().or_else(beer),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListenPolicy;

impl KindPolicy for ListenPolicy {
    fn kind(&self) -> Kind {
        Kind::Listen
    }

    fn has_required_fields(&self, record: &ReactionRecord, _service: Service) -> bool {
        record.field(field::TRACK).is_some() && record.field(field::ARTIST).is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchPolicy;

impl KindPolicy for WatchPolicy {
    fn kind(&self) -> Kind {
        Kind::Watch
    }

    fn has_required_fields(&self, record: &ReactionRecord, _service: Service) -> bool {
        record.field(field::TITLE).is_some()
    }

    fn prepare_import(&self, record: &mut NewRecord) {
        if record.field(field::MEDIA_TYPE).is_none() {
            record.set(field::MEDIA_TYPE, "movie");
        }
    }
}

/// Why `on_publish` did nothing. Variants follow guard order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    KindMismatch,
    Disabled,
    OptedOut,
    NotConnected,
    AlreadySyndicated,
    Loopback,
    MissingFields,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Skipped { reason: SkipReason },
    Syndicated { external_id: String, url: Option<String> },
    Failed { error: String },
}

impl PublishOutcome {
    fn skipped(reason: SkipReason) -> Self {
        PublishOutcome::Skipped { reason }
    }
}

/// Per-engine settings drawn from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// POSSE toggle for the paired service.
    pub sync_to: bool,
    /// Half-width of the fuzzy duplicate window.
    pub duplicate_window: Duration,
    /// Status given to imported records.
    pub import_status: Status,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sync_to: false,
            duplicate_window: Duration::minutes(5),
            import_status: Status::Published,
        }
    }
}

type LockKey = (String, Service);

/// At most one syndication per (record, service) in flight.
#[derive(Debug, Clone, Default)]
pub struct SyncLocks {
    inner: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

pub struct SyncGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl SyncLocks {
    pub async fn acquire(&self, record_id: &str, service: Service) -> SyncGuard {
        let key = (record_id.to_string(), service);
        let lock = self
            .inner
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        SyncGuard {
            key,
            guard: Some(guard),
            map: self.inner.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits on it.
        self.map
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Object-safe face of a [`SyncEngine`], used by the dispatcher, jobs and API.
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> Kind;

    fn service(&self) -> Service;

    /// Syndicates a record that just became published, if every guard passes.
    async fn on_publish(&self, record: &ReactionRecord) -> PublishOutcome;

    /// Manual syndication: every guard except the per-service toggle.
    async fn syndicate_now(&self, record_id: &str) -> PublishOutcome;

    async fn import_batch(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ImportResult, SyncError>;
}

enum Imported {
    Created,
    Duplicate,
}

pub struct SyncEngine<P: KindPolicy> {
    policy: P,
    adapter: Arc<dyn ServiceAdapter>,
    store: Arc<dyn ContentStore>,
    locks: SyncLocks,
    settings: EngineSettings,
}

impl<P: KindPolicy> SyncEngine<P> {
    pub fn new(
        policy: P,
        adapter: Arc<dyn ServiceAdapter>,
        store: Arc<dyn ContentStore>,
        locks: SyncLocks,
        settings: EngineSettings,
    ) -> Self {
        Self {
            policy,
            adapter,
            store,
            locks,
            settings,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn ServiceAdapter> {
        &self.adapter
    }

    fn service_of(&self) -> Service {
        self.adapter.service()
    }

    /// Eligibility guards, in order. The first failing one wins.
    async fn check(&self, record: &ReactionRecord, honor_toggle: bool) -> Result<(), SkipReason> {
        let service = self.service_of();
        if record.kind != self.policy.kind() {
            return Err(SkipReason::KindMismatch);
        }
        if honor_toggle && !self.settings.sync_to {
            return Err(SkipReason::Disabled);
        }
        if record.opted_out(service) {
            return Err(SkipReason::OptedOut);
        }
        if !self.adapter.is_connected().await {
            return Err(SkipReason::NotConnected);
        }
        if record.is_syndicated_to(service) {
            return Err(SkipReason::AlreadySyndicated);
        }
        if record.imported_from == Some(service) {
            return Err(SkipReason::Loopback);
        }
        if !self.policy.has_required_fields(record, service) {
            return Err(SkipReason::MissingFields);
        }
        Ok(())
    }

    async fn run(&self, record_id: &str, honor_toggle: bool) -> PublishOutcome {
        let service = self.service_of();
        let _guard = self.locks.acquire(record_id, service).await;

        // Re-read under the lock: a concurrent attempt may have just finished.
        let record = match self.store.get(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return PublishOutcome::skipped(SkipReason::NotFound),
            Err(err) => {
                warn!(?err, record_id, %service, "failed to load record");
                return PublishOutcome::Failed {
                    error: err.to_string(),
                };
            }
        };
        if let Err(reason) = self.check(&record, honor_toggle).await {
            debug!(record_id, %service, ?reason, "syndication skipped");
            return PublishOutcome::skipped(reason);
        }

        match self.adapter.syndicate(&record).await {
            Ok(done) => {
                if !done.resolved.is_empty() {
                    if let Err(err) = self.store.update_fields(record_id, &done.resolved).await {
                        warn!(?err, record_id, %service, "failed to store resolved ids");
                    }
                }
                match self
                    .store
                    .record_syndication(record_id, service, &done.external_id, done.url.as_deref())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!(record_id, %service, "external id was already set"),
                    Err(err) => {
                        warn!(?err, record_id, %service, "syndicated but failed to store external id");
                        return PublishOutcome::Failed {
                            error: err.to_string(),
                        };
                    }
                }
                info!(record_id, %service, external_id = %done.external_id, "syndicated");
                PublishOutcome::Syndicated {
                    external_id: done.external_id,
                    url: done.url,
                }
            }
            Err(err) => {
                warn!(?err, record_id, %service, "syndication failed");
                let error = err.to_string();
                match self
                    .store
                    .record_failed_attempt(record_id, service, &error)
                    .await
                {
                    Ok(attempts) => debug!(record_id, %service, attempts, "failure recorded"),
                    Err(err) => warn!(?err, record_id, %service, "failed to record attempt"),
                }
                PublishOutcome::Failed { error }
            }
        }
    }

    async fn import_one(&self, item: &ExternalItem) -> Result<Imported, SyncError> {
        let service = self.service_of();
        if !item.external_id.is_empty() {
            if let Some(existing) = self
                .store
                .find_by_external_id(service, &item.external_id)
                .await?
            {
                debug!(id = %existing.id, external_id = %item.external_id, "duplicate by external id");
                return Ok(Imported::Duplicate);
            }
        }

        let mut rec = self.adapter.to_record(item)?;
        if rec.kind != self.policy.kind() {
            return Err(SyncError::malformed(format!(
                "{service} produced a {} record for the {} engine",
                rec.kind,
                self.policy.kind()
            )));
        }
        self.policy.prepare_import(&mut rec);

        if let Some((key, value)) = self.policy.fuzzy_key(&rec, service) {
            let window = TimeWindow::around(rec.occurred_at, self.settings.duplicate_window);
            let twin = self
                .store
                .find_by_field_near(rec.kind, key, value, window, Some(service))
                .await?
                .filter(|existing| {
                    existing
                        .external_ids
                        .get(&service)
                        .map_or(true, |id| id.trim().is_empty() || *id == item.external_id)
                });
            if let Some(existing) = twin {
                debug!(id = %existing.id, %value, "duplicate by name and time");
                // Link the twin so the next run matches it by id.
                if !existing.is_syndicated_to(service) && !item.external_id.is_empty() {
                    self.store
                        .record_syndication(
                            &existing.id,
                            service,
                            &item.external_id,
                            item.url.as_deref(),
                        )
                        .await?;
                }
                return Ok(Imported::Duplicate);
            }
        }

        rec.status = self.settings.import_status;
        rec.imported_from = Some(service);
        rec.external_id = Some(ExternalRef {
            service,
            id: item.external_id.clone(),
            url: item.url.clone(),
        });
        let created = self.store.create(rec).await?;
        debug!(id = %created.id, external_id = %item.external_id, "imported");
        Ok(Imported::Created)
    }
}

#[async_trait]
impl<P: KindPolicy> Engine for SyncEngine<P> {
    fn kind(&self) -> Kind {
        self.policy.kind()
    }

    fn service(&self) -> Service {
        self.service_of()
    }

    #[instrument(skip_all, fields(kind = %self.policy.kind(), service = %self.service_of(), record_id = %record.id))]
    async fn on_publish(&self, record: &ReactionRecord) -> PublishOutcome {
        // Cheap pre-check on the event's copy before taking the lock.
        if let Err(reason) = self.check(record, true).await {
            debug!(?reason, "syndication skipped");
            return PublishOutcome::skipped(reason);
        }
        self.run(&record.id, true).await
    }

    #[instrument(skip_all, fields(kind = %self.policy.kind(), service = %self.service_of(), record_id = %record_id))]
    async fn syndicate_now(&self, record_id: &str) -> PublishOutcome {
        self.run(record_id, false).await
    }

    #[instrument(skip_all, fields(kind = %self.policy.kind(), service = %self.service_of(), limit = limit))]
    async fn import_batch(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ImportResult, SyncError> {
        let items = self.adapter.fetch_recent_items(limit).await?;
        let mut result = ImportResult {
            total: items.len(),
            ..Default::default()
        };
        for item in &items {
            if cancel.is_cancelled() {
                info!(processed = result.imported + result.skipped + result.errors, "import cancelled");
                result.cancelled = true;
                break;
            }
            match self.import_one(item).await {
                Ok(Imported::Created) => result.imported += 1,
                Ok(Imported::Duplicate) => result.skipped += 1,
                Err(err) => {
                    warn!(?err, external_id = %item.external_id, "import item failed");
                    result.errors += 1;
                }
            }
        }
        info!(
            imported = result.imported,
            skipped = result.skipped,
            errors = result.errors,
            total = result.total,
            "import finished"
        );
        Ok(result)
    }
}
