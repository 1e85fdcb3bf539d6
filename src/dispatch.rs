//! Publish-transition dispatch: the store's publish operation routed to every
//! engine that manages the record's kind.
use crate::engine::{Engine, PublishOutcome};
use crate::model::{Service, Status};
use crate::store::{ContentStore, StatusChange};
use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct PublishDispatcher {
    store: Arc<dyn ContentStore>,
    engines: Vec<Arc<dyn Engine>>,
}

/// Result of a status write plus whatever the engines did about it.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub change: StatusChange,
    pub outcomes: Vec<(Service, PublishOutcome)>,
}

impl PublishDispatcher {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            engines: Vec::new(),
        }
    }

    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.push(engine);
    }

    pub fn engines(&self) -> &[Arc<dyn Engine>] {
        &self.engines
    }

    pub fn engine_for(&self, service: Service) -> Option<&Arc<dyn Engine>> {
        self.engines.iter().find(|e| e.service() == service)
    }

    /// Writes the status and, on a genuine transition into published, runs the
    /// matching engines concurrently. Other transitions fire nothing.
    #[instrument(skip_all, fields(record_id = %id, status = status.as_str()))]
    pub async fn set_status(&self, id: &str, status: Status) -> Result<Dispatched> {
        let change = self.store.set_status(id, status).await?;
        if !change.entered_published() {
            debug!(previous = change.previous.as_str(), "no publish transition");
            return Ok(Dispatched {
                change,
                outcomes: Vec::new(),
            });
        }
        let outcomes = self.dispatch(&change).await;
        Ok(Dispatched { change, outcomes })
    }

    async fn dispatch(&self, change: &StatusChange) -> Vec<(Service, PublishOutcome)> {
        let record = &change.record;
        let matching: Vec<_> = self
            .engines
            .iter()
            .filter(|e| e.kind() == record.kind)
            .collect();
        join_all(matching.into_iter().map(|engine| async move {
            (engine.service(), engine.on_publish(record).await)
        }))
        .await
    }
}
