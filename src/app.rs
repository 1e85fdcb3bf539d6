//! Wiring: builds stores, adapters, engines and the HTTP state from config.
use crate::adapters::foursquare::FoursquareAdapter;
use crate::adapters::lastfm::LastfmAdapter;
use crate::adapters::owntracks::{LocationReceiver, OwntracksAdapter};
use crate::adapters::trakt::TraktAdapter;
use crate::adapters::untappd::UntappdAdapter;
use crate::adapters::{AdapterContext, ServiceAdapter};
use crate::api::AppState;
use crate::config::Config;
use crate::db::{Pool, SqliteContentStore, SqliteCredentialStore};
use crate::dispatch::PublishDispatcher;
use crate::engine::{
    CheckinPolicy, Engine, EngineSettings, ListenPolicy, SyncEngine, SyncLocks, WatchPolicy,
};
use crate::geocode::{Geocoder, NominatimGeocoder};
use crate::jobs::ImportJobs;
use crate::model::{Kind, Service};
use crate::oauth::OAuthFlow;
use crate::store::{ContentStore, CredentialStore};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct App {
    pub state: AppState,
    /// Engines whose `auto_import` toggle is on.
    pub scheduled: Vec<Arc<dyn Engine>>,
}

/// Content kind each service syncs.
pub fn kind_for(service: Service) -> Kind {
    match service {
        Service::Foursquare | Service::Untappd | Service::Owntracks => Kind::Checkin,
        Service::Lastfm => Kind::Listen,
        Service::Trakt => Kind::Watch,
    }
}

pub fn adapter_for(service: Service, ctx: AdapterContext) -> Arc<dyn ServiceAdapter> {
    match service {
        Service::Foursquare => Arc::new(FoursquareAdapter::new(ctx)),
        Service::Untappd => Arc::new(UntappdAdapter::new(ctx)),
        Service::Lastfm => Arc::new(LastfmAdapter::new(ctx)),
        Service::Trakt => Arc::new(TraktAdapter::new(ctx)),
        Service::Owntracks => Arc::new(OwntracksAdapter::new(ctx)),
    }
}

pub fn engine_for(
    adapter: Arc<dyn ServiceAdapter>,
    store: Arc<dyn ContentStore>,
    locks: SyncLocks,
    settings: EngineSettings,
) -> Arc<dyn Engine> {
    match kind_for(adapter.service()) {
        Kind::Listen => Arc::new(SyncEngine::new(ListenPolicy, adapter, store, locks, settings)),
        Kind::Watch => Arc::new(SyncEngine::new(WatchPolicy, adapter, store, locks, settings)),
        _ => Arc::new(SyncEngine::new(CheckinPolicy, adapter, store, locks, settings)),
    }
}

/// Seeds static credentials for every configured service. Rotating tokens
/// already in the store are left alone.
pub async fn seed_credentials(cfg: &Config, credentials: &dyn CredentialStore) -> Result<()> {
    for (service, settings) in &cfg.services {
        credentials.set(*service, settings.seed_patch()).await?;
        debug!(%service, "credentials seeded");
    }
    Ok(())
}

pub async fn build(cfg: &Config, pool: Pool, shutdown: CancellationToken) -> Result<App> {
    let store: Arc<dyn ContentStore> = Arc::new(SqliteContentStore::new(pool.clone()));
    let credentials: Arc<dyn CredentialStore> = Arc::new(SqliteCredentialStore::new(pool));
    seed_credentials(cfg, credentials.as_ref()).await?;

    let ctx = AdapterContext::new(credentials.clone(), cfg.public_url()?, cfg.http_timeout())?;
    let locks = SyncLocks::default();
    let mut dispatcher = PublishDispatcher::new(store.clone());
    let mut adapters = BTreeMap::new();
    let mut scheduled = Vec::new();

    for service in cfg.services.keys().copied() {
        let adapter = adapter_for(service, ctx.clone());
        let kind = kind_for(service);
        let settings = EngineSettings {
            sync_to: cfg.sync.sync_to(service),
            duplicate_window: cfg.duplicate_window(),
            import_status: cfg.sync.default_status(kind),
        };
        let engine = engine_for(adapter.clone(), store.clone(), locks.clone(), settings);
        if cfg.sync.auto_import(service) && service != Service::Owntracks {
            scheduled.push(engine.clone());
        }
        dispatcher.register(engine);
        adapters.insert(service, adapter);
        info!(%service, %kind, sync_to = cfg.sync.sync_to(service), "service enabled");
    }

    let locations = if cfg.services.contains_key(&Service::Owntracks) {
        let geocoder: Option<Arc<dyn Geocoder>> = if cfg.geocoder.enabled {
            Some(Arc::new(NominatimGeocoder::new(
                &cfg.geocoder,
                cfg.http_timeout(),
            )?))
        } else {
            None
        };
        Some(Arc::new(LocationReceiver::new(
            OwntracksAdapter::new(ctx.clone()),
            store.clone(),
            geocoder,
            cfg.sync.location_status,
            cfg.app.location_radius_degrees,
            cfg.duplicate_window(),
        )))
    } else {
        None
    };

    let state = AppState {
        store,
        credentials: credentials.clone(),
        adapters: Arc::new(adapters),
        dispatcher: Arc::new(dispatcher),
        oauth: OAuthFlow::new(credentials),
        jobs: ImportJobs::new(shutdown),
        locations,
        import_limit: cfg.app.import_limit,
        admin_redirect: cfg.app.admin_redirect.clone(),
    };
    Ok(App { state, scheduled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::db;
    use crate::model::cred;

    #[tokio::test]
    async fn build_registers_configured_services() {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        let pool = db::memory_pool().await.unwrap();
        let app = build(&cfg, pool, CancellationToken::new()).await.unwrap();

        assert_eq!(app.state.adapters.len(), 5);
        assert_eq!(app.state.dispatcher.engines().len(), 5);
        let scheduled: Vec<_> = app.scheduled.iter().map(|e| e.service()).collect();
        assert_eq!(scheduled, vec![Service::Foursquare, Service::Lastfm]);
        assert!(app.state.locations.is_some());

        let trakt = app.state.credentials.get(Service::Trakt).await.unwrap();
        assert_eq!(trakt.get(cred::CLIENT_ID), Some("TRAKT_CLIENT_ID"));
        assert!(trakt.enabled());
        assert_eq!(
            app.state.dispatcher.engine_for(Service::Lastfm).unwrap().kind(),
            Kind::Listen
        );
    }

    #[tokio::test]
    async fn reseeding_keeps_tokens() {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        let pool = db::memory_pool().await.unwrap();
        let creds = SqliteCredentialStore::new(pool);
        seed_credentials(&cfg, &creds).await.unwrap();
        creds
            .set(
                Service::Trakt,
                crate::model::CredentialPatch::default().set(cred::ACCESS_TOKEN, "tok"),
            )
            .await
            .unwrap();
        seed_credentials(&cfg, &creds).await.unwrap();
        assert_eq!(creds.get(Service::Trakt).await.unwrap().access_token(), Some("tok"));
    }
}
