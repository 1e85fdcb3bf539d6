//! OwnTracks: location pushes arrive by webhook, nothing is ever sent back.
use super::{json_str, synthesize_id, AdapterContext, ExternalItem, ServiceAdapter, Syndicated};
use crate::error::SyncError;
use crate::geocode::Geocoder;
use crate::model::{
    cred, field, Credential, ExternalRef, Kind, NewRecord, ReactionRecord, Service, Status,
};
use crate::store::{ContentStore, TimeWindow};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const SERVICE: Service = Service::Owntracks;

#[derive(Clone)]
pub struct OwntracksAdapter {
    ctx: AdapterContext,
}

impl OwntracksAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self { ctx }
    }

    /// Checks an `Authorization: Basic ..` header against the webhook credentials.
    pub async fn authorize(&self, header: Option<&str>) -> bool {
        let c = self.ctx.credential_or_default(SERVICE).await;
        c.enabled() && basic_auth_matches(header, &c)
    }
}

pub fn basic_auth_matches(header: Option<&str>, c: &Credential) -> bool {
    let (Some(user), Some(pass)) = (c.get(cred::WEBHOOK_USERNAME), c.get(cred::WEBHOOK_PASSWORD))
    else {
        return false;
    };
    let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == pass,
        None => false,
    }
}

/// A push the receiver can act on.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationPush {
    pub lat: f64,
    pub lon: f64,
    pub at: DateTime<Utc>,
    pub device: String,
    /// Waypoint or region name, when the device knows one.
    pub place: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Location(LocationPush),
    /// A recognised message that needs no action (`leave`, `lwt`, `card`, ...).
    Ignored(String),
}

fn number(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn parse_message(body: &Value) -> Result<Message, SyncError> {
    let kind = body
        .get("_type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::malformed("message without _type"))?;
    let place = match kind {
        "location" => body
            .get("inregions")
            .and_then(Value::as_array)
            .and_then(|r| r.first())
            .and_then(json_str),
        "transition" if body.get("event").and_then(Value::as_str) == Some("enter") => {
            body.get("desc").and_then(json_str)
        }
        other => return Ok(Message::Ignored(other.to_string())),
    };
    let lat = number(body, "lat").ok_or_else(|| SyncError::malformed("location without lat"))?;
    let lon = number(body, "lon").ok_or_else(|| SyncError::malformed("location without lon"))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(SyncError::malformed("coordinates out of range"));
    }
    let at = number(body, "tst")
        .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
        .ok_or_else(|| SyncError::malformed("location without tst"))?;
    let device = body
        .get("tid")
        .or_else(|| body.get("topic"))
        .and_then(json_str)
        .unwrap_or_default();
    Ok(Message::Location(LocationPush {
        lat,
        lon,
        at,
        device,
        place,
    }))
}

pub fn push_id(push: &LocationPush) -> String {
    synthesize_id(&[&push.device, &push.at.timestamp().to_string()])
}

#[async_trait]
impl ServiceAdapter for OwntracksAdapter {
    fn service(&self) -> Service {
        SERVICE
    }

    async fn is_connected(&self) -> bool {
        let c = self.ctx.credential_or_default(SERVICE).await;
        c.enabled()
            && c.get(cred::WEBHOOK_USERNAME).is_some()
            && c.get(cred::WEBHOOK_PASSWORD).is_some()
    }

    async fn auth_url(&self, _state: &str) -> Option<String> {
        None
    }

    async fn handle_oauth_callback(&self, _code: &str) -> bool {
        false
    }

    async fn syndicate(&self, _record: &ReactionRecord) -> Result<Syndicated, SyncError> {
        Err(SyncError::Unsupported(SERVICE))
    }

    /// Pushes only; there is no history to pull.
    async fn fetch_recent_items(&self, _limit: usize) -> Result<Vec<ExternalItem>, SyncError> {
        Ok(Vec::new())
    }

    fn to_record(&self, item: &ExternalItem) -> Result<NewRecord, SyncError> {
        let Message::Location(push) = parse_message(&item.payload)? else {
            return Err(SyncError::malformed("not a location message"));
        };
        let mut rec = NewRecord::new(Kind::Checkin, push.at);
        rec.set(field::LATITUDE, push.lat.to_string());
        rec.set(field::LONGITUDE, push.lon.to_string());
        rec.set(field::VENUE_NAME, push.place.unwrap_or_default());
        Ok(rec)
    }
}

/// What happened to one webhook message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    Created(String),
    Duplicate(String),
    Ignored(String),
}

/// Turns location pushes into checkins, skipping ones already near an
/// existing checkin in space and time.
pub struct LocationReceiver {
    adapter: OwntracksAdapter,
    store: Arc<dyn ContentStore>,
    geocoder: Option<Arc<dyn Geocoder>>,
    status: Status,
    radius_degrees: f64,
    window: Duration,
}

impl LocationReceiver {
    pub fn new(
        adapter: OwntracksAdapter,
        store: Arc<dyn ContentStore>,
        geocoder: Option<Arc<dyn Geocoder>>,
        status: Status,
        radius_degrees: f64,
        window: Duration,
    ) -> Self {
        Self {
            adapter,
            store,
            geocoder,
            status,
            radius_degrees,
            window,
        }
    }

    pub fn adapter(&self) -> &OwntracksAdapter {
        &self.adapter
    }

    #[instrument(skip_all)]
    pub async fn receive(&self, body: &Value) -> Result<Receipt, SyncError> {
        let push = match parse_message(body)? {
            Message::Location(push) => push,
            Message::Ignored(kind) => {
                debug!(%kind, "ignoring owntracks message");
                return Ok(Receipt::Ignored(kind));
            }
        };
        let external_id = push_id(&push);
        if let Some(existing) = self.store.find_by_external_id(SERVICE, &external_id).await? {
            debug!(id = %existing.id, "location push already stored");
            return Ok(Receipt::Duplicate(existing.id));
        }
        let window = TimeWindow::around(push.at, self.window);
        if let Some(existing) = self
            .store
            .find_near(Kind::Checkin, push.lat, push.lon, self.radius_degrees, window)
            .await?
        {
            debug!(id = %existing.id, "location push near existing checkin");
            return Ok(Receipt::Duplicate(existing.id));
        }

        let item = ExternalItem {
            service: SERVICE,
            external_id: external_id.clone(),
            occurred_at: push.at,
            url: None,
            payload: body.clone(),
        };
        let mut rec = self.adapter.to_record(&item)?;
        self.enrich(&mut rec, push.lat, push.lon).await;
        rec.status = self.status;
        rec.imported_from = Some(SERVICE);
        rec.external_id = Some(ExternalRef {
            service: SERVICE,
            id: external_id,
            url: None,
        });
        let created = self.store.create(rec).await?;
        info!(id = %created.id, "checkin created from location push");
        Ok(Receipt::Created(created.id))
    }

    /// Best effort: a failed lookup leaves the address fields blank.
    async fn enrich(&self, rec: &mut NewRecord, lat: f64, lon: f64) {
        let Some(geocoder) = &self.geocoder else {
            return;
        };
        match geocoder.reverse(lat, lon).await {
            Ok(Some(place)) => {
                if rec.field(field::VENUE_NAME).is_none() {
                    rec.set(field::VENUE_NAME, place.name.unwrap_or_default());
                }
                rec.set(field::ADDRESS, place.address.unwrap_or_default());
                rec.set(field::LOCALITY, place.locality.unwrap_or_default());
                rec.set(field::REGION, place.region.unwrap_or_default());
                rec.set(field::COUNTRY, place.country.unwrap_or_default());
            }
            Ok(None) => debug!("no geocoding result"),
            Err(err) => warn!(?err, "reverse geocoding failed"),
        }
    }
}
