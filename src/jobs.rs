//! Import job registry and the scheduled import loop.
use crate::engine::Engine;
use crate::error::SyncError;
use crate::model::{ImportResult, Service};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("an import for {0} is already running")]
    AlreadyRunning(Service),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Short-lived view of a service's imports; kept in memory only.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct JobStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_result: Option<ImportResult>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct JobState {
    cancel: Option<CancellationToken>,
    status: JobStatus,
}

/// One import per service at a time. Tokens are children of `shutdown`, so
/// stopping the process cancels running imports between items.
#[derive(Clone)]
pub struct ImportJobs {
    jobs: Arc<DashMap<Service, JobState>>,
    shutdown: CancellationToken,
}

impl ImportJobs {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    fn begin(&self, service: Service) -> Result<CancellationToken, JobError> {
        let token = self.shutdown.child_token();
        let mut state = match self.jobs.entry(service) {
            Entry::Occupied(e) if e.get().cancel.is_some() => {
                return Err(JobError::AlreadyRunning(service))
            }
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(e) => e.insert(JobState::default()),
        };
        state.cancel = Some(token.clone());
        state.status.running = true;
        state.status.started_at = Some(Utc::now());
        Ok(token)
    }

    fn finish(&self, service: Service, outcome: Result<ImportResult, String>) {
        if let Some(mut state) = self.jobs.get_mut(&service) {
            state.cancel = None;
            state.status.running = false;
            state.status.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    state.status.last_result = Some(result);
                    state.status.last_error = None;
                }
                Err(err) => state.status.last_error = Some(err),
            }
        }
    }

    /// Runs one batch on `engine`, refusing to overlap a running one.
    ///
    /// Dropping the returned future mid-batch (a client disconnect, a
    /// timeout) still frees the service for the next run.
    pub async fn run(&self, engine: &dyn Engine, limit: usize) -> Result<ImportResult, JobError> {
        let service = engine.service();
        let token = self.begin(service)?;
        let mut guard = RunGuard {
            jobs: self,
            service,
            token: token.clone(),
            outcome: None,
        };
        let outcome = engine.import_batch(limit, &token).await;
        guard.outcome = Some(outcome.as_ref().map(|r| *r).map_err(ToString::to_string));
        drop(guard);
        Ok(outcome?)
    }

    /// Signals the running import, if any. Items already stored stay stored.
    pub fn cancel(&self, service: Service) -> bool {
        match self.jobs.get(&service).and_then(|s| s.cancel.clone()) {
            Some(token) => {
                token.cancel();
                info!(%service, "import cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn status(&self, service: Service) -> JobStatus {
        self.jobs
            .get(&service)
            .map(|s| s.status.clone())
            .unwrap_or_default()
    }
}

/// Releases a service's running slot when its run ends, however it ends.
struct RunGuard<'a> {
    jobs: &'a ImportJobs,
    service: Service,
    token: CancellationToken,
    outcome: Option<Result<ImportResult, String>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            self.token.cancel();
            warn!(service = %self.service, "import interrupted before it finished");
            Err("import interrupted".to_string())
        });
        self.jobs.finish(self.service, outcome);
    }
}

/// Periodically imports from every engine in `engines`. Ticks that find an
/// import still running for a service skip that service.
pub fn spawn_scheduler(
    jobs: ImportJobs,
    engines: Vec<Arc<dyn Engine>>,
    interval: Duration,
    limit: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; start after one full interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("import scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }
            for engine in &engines {
                let service = engine.service();
                match jobs.run(engine.as_ref(), limit).await {
                    Ok(result) => debug!(%service, ?result, "scheduled import done"),
                    Err(JobError::AlreadyRunning(_)) => {
                        debug!(%service, "import already running; tick skipped")
                    }
                    Err(err) => warn!(?err, %service, "scheduled import failed"),
                }
            }
        }
    })
}
