//! HTTP surface: OAuth, manual imports, disconnect, webhooks and the record
//! create/publish/syndicate actions.
use crate::adapters::owntracks::{LocationReceiver, Receipt};
use crate::adapters::ServiceAdapter;
use crate::dispatch::PublishDispatcher;
use crate::engine::{PublishOutcome, SkipReason};
use crate::error::SyncError;
use crate::jobs::{ImportJobs, JobError};
use crate::model::{cred, Fields, Kind, NewRecord, Service, Status};
use crate::oauth::OAuthFlow;
use crate::store::{ContentStore, CredentialStore};
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContentStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub adapters: Arc<BTreeMap<Service, Arc<dyn ServiceAdapter>>>,
    pub dispatcher: Arc<PublishDispatcher>,
    pub oauth: OAuthFlow,
    pub jobs: ImportJobs,
    pub locations: Option<Arc<LocationReceiver>>,
    pub import_limit: usize,
    pub admin_redirect: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        warn!(?err, "request failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", err.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            SyncError::NotConnected(_) => (StatusCode::CONFLICT, "NOT_CONNECTED"),
            SyncError::Unsupported(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED"),
            SyncError::Malformed(_) => (StatusCode::BAD_GATEWAY, "MALFORMED_UPSTREAM"),
            SyncError::Auth(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_AUTH"),
            SyncError::Transient(_) | SyncError::Unresolvable(_) => {
                (StatusCode::BAD_GATEWAY, "UPSTREAM")
            }
            SyncError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE"),
        };
        ApiError::new(status, code, err.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::AlreadyRunning(_) => {
                ApiError::new(StatusCode::CONFLICT, "IMPORT_RUNNING", err.to_string())
            }
            JobError::Sync(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_service(raw: &str) -> ApiResult<Service> {
    Service::parse_service(raw)
        .ok_or_else(|| ApiError::not_found("UNKNOWN_SERVICE", format!("unknown service {raw}")))
}

fn parse_status(raw: &str) -> ApiResult<Status> {
    Status::parse_status(raw).ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "BAD_STATUS", format!("unknown status {raw}"))
    })
}

impl AppState {
    fn adapter(&self, service: Service) -> ApiResult<&Arc<dyn ServiceAdapter>> {
        self.adapters.get(&service).ok_or_else(|| {
            ApiError::not_found("UNKNOWN_SERVICE", format!("{service} is not configured"))
        })
    }

    /// `admin_redirect` with `service=..` and the outcome flag appended.
    fn admin_url(&self, service: Service, outcome: &str) -> String {
        let sep = if self.admin_redirect.contains('?') { '&' } else { '?' };
        format!("{}{}service={}&{}", self.admin_redirect, sep, service, outcome)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/oauth/{service}/authorize", get(oauth_authorize))
        .route("/oauth/{service}/callback", get(oauth_callback))
        .route("/sync/{service}/import", post(import))
        .route("/sync/{service}/import/cancel", post(cancel_import))
        .route("/sync/{service}/status", get(sync_status))
        .route("/sync/{service}/disconnect", post(disconnect))
        .route("/webhooks/{service}", post(webhook))
        .route("/records", post(create_record))
        .route("/records/{id}/status", post(set_record_status))
        .route("/records/{id}/syndicate/{service}", post(syndicate_record))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, router: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn oauth_authorize(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Redirect> {
    let service = parse_service(&service)?;
    let adapter = state.adapter(service)?;
    match state.oauth.start(adapter.as_ref()).await? {
        Some(url) => Ok(Redirect::to(&url)),
        None => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "NO_OAUTH",
            format!("{service} has no authorization flow configured"),
        )),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    /// Last.fm's web auth calls it `token`.
    token: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Redirect> {
    let service = parse_service(&service)?;
    let adapter = state.adapter(service)?;
    let code = params.code.as_deref().or(params.token.as_deref());
    let outcome = state
        .oauth
        .finish(
            adapter.as_ref(),
            code,
            params.state.as_deref(),
            params.error.as_deref(),
        )
        .await;
    let flag = match outcome {
        Ok(()) => "connected=1".to_string(),
        Err(err) => format!("error={}", err.flag()),
    };
    Ok(Redirect::to(&state.admin_url(service, &flag)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportRequest {
    limit: Option<usize>,
}

async fn import(
    State(state): State<AppState>,
    Path(service): Path<String>,
    body: Option<Json<ImportRequest>>,
) -> ApiResult<impl IntoResponse> {
    let service = parse_service(&service)?;
    let engine = state.dispatcher.engine_for(service).ok_or_else(|| {
        ApiError::not_found("NO_ENGINE", format!("{service} has no import engine"))
    })?;
    let limit = body
        .and_then(|Json(req)| req.limit)
        .filter(|l| *l > 0)
        .unwrap_or(state.import_limit);
    let result = state.jobs.run(engine.as_ref(), limit).await?;
    Ok(Json(result))
}

async fn cancel_import(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = parse_service(&service)?;
    Ok(Json(json!({ "cancelled": state.jobs.cancel(service) })))
}

async fn sync_status(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = parse_service(&service)?;
    let adapter = state.adapter(service)?;
    let c = state.credentials.get(service).await?;
    Ok(Json(json!({
        "service": service,
        "enabled": c.enabled(),
        "connected": adapter.is_connected().await,
        "display_name": c.get(cred::DISPLAY_NAME),
        "import": state.jobs.status(service),
    })))
}

async fn disconnect(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let service = parse_service(&service)?;
    state.credentials.clear_tokens(service).await?;
    info!(%service, "disconnected");
    Ok(Json(json!({ "disconnected": true })))
}

async fn webhook(
    State(state): State<AppState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let service = parse_service(&service)?;
    let receiver = match (service, &state.locations) {
        (Service::Owntracks, Some(receiver)) => receiver,
        _ => {
            return Err(ApiError::not_found(
                "NO_WEBHOOK",
                format!("{service} does not accept webhooks"),
            ))
        }
    };
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !receiver.adapter().authorize(auth).await {
        return Ok((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"owntracks\"")],
        )
            .into_response());
    }
    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, "BAD_JSON", e.to_string())
    })?;
    match receiver.receive(&payload).await {
        Ok(Receipt::Created(id)) => info!(%id, "location stored"),
        Ok(Receipt::Duplicate(_) | Receipt::Ignored(_)) => {}
        Err(SyncError::Malformed(msg)) => {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "BAD_PAYLOAD", msg))
        }
        Err(err) => return Err(err.into()),
    }
    // OwnTracks expects a JSON array of messages to deliver back.
    Ok(Json(json!([])).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreateRecordRequest {
    kind: String,
    #[serde(default)]
    fields: Fields,
    #[serde(default)]
    content_note: String,
    status: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

/// Stores a new record as a draft, then moves it to the requested status
/// through the dispatcher so publishing syndicates like any other edit.
async fn create_record(
    State(state): State<AppState>,
    Json(req): Json<CreateRecordRequest>,
) -> ApiResult<impl IntoResponse> {
    let kind = Kind::parse_kind(&req.kind).ok_or_else(|| {
        ApiError::new(StatusCode::BAD_REQUEST, "BAD_KIND", format!("unknown kind {}", req.kind))
    })?;
    let status = req.status.as_deref().map(parse_status).transpose()?;

    let mut rec = NewRecord::new(kind, req.occurred_at.unwrap_or_else(Utc::now));
    rec.content_note = req.content_note;
    for (key, value) in req.fields {
        rec.set(&key, value);
    }
    let created = state.store.create(rec).await?;
    info!(id = %created.id, %kind, "record created");

    let (record, outcomes) = match status {
        Some(status) if status != Status::Draft => {
            let done = state.dispatcher.set_status(&created.id, status).await?;
            let outcomes: BTreeMap<Service, PublishOutcome> = done.outcomes.into_iter().collect();
            (done.change.record, outcomes)
        }
        _ => (created, BTreeMap::new()),
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({ "record": record, "syndication": outcomes })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    status: String,
}

async fn set_record_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let status = parse_status(&req.status)?;
    if state.store.get(&id).await?.is_none() {
        return Err(ApiError::not_found("NO_RECORD", format!("record {id} not found")));
    }
    let done = state.dispatcher.set_status(&id, status).await?;
    let outcomes: BTreeMap<Service, PublishOutcome> = done.outcomes.into_iter().collect();
    Ok(Json(json!({
        "record": done.change.record,
        "previous": done.change.previous,
        "syndication": outcomes,
    })))
}

async fn syndicate_record(
    State(state): State<AppState>,
    Path((id, service)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let service = parse_service(&service)?;
    let engine = state.dispatcher.engine_for(service).ok_or_else(|| {
        ApiError::not_found("NO_ENGINE", format!("{service} has no sync engine"))
    })?;
    let outcome = engine.syndicate_now(&id).await;
    let status = match &outcome {
        PublishOutcome::Skipped {
            reason: SkipReason::NotFound,
        } => StatusCode::NOT_FOUND,
        PublishOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    let failed_attempts = state.store.failed_attempts(&id, service).await?;
    Ok((
        status,
        Json(SyndicateResponse {
            outcome,
            failed_attempts,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct SyndicateResponse {
    #[serde(flatten)]
    outcome: PublishOutcome,
    /// Consecutive failures for this record and service; reset on success.
    failed_attempts: u32,
}
