use super::{json_str, parse_base, read_json, AdapterContext, ExternalItem, ServiceAdapter, Syndicated};
use crate::error::SyncError;
use crate::model::{cred, field, CredentialPatch, Fields, Kind, NewRecord, ReactionRecord, Service};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.foursquare.com/v2/";
const AUTH_BASE: &str = "https://foursquare.com/oauth2/";
const API_VERSION: &str = "20240101";
const PAGE_MAX: usize = 250;
const SHOUT_MAX: usize = 140;
const SERVICE: Service = Service::Foursquare;

#[derive(Clone)]
pub struct FoursquareAdapter {
    ctx: AdapterContext,
    api_base: Url,
    auth_base: Url,
}

impl fmt::Debug for FoursquareAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoursquareAdapter")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Venue {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: VenueLocation,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VenueLocation {
    pub distance: Option<f64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

impl FoursquareAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self::with_base_urls(ctx, parse_base(API_BASE), parse_base(AUTH_BASE))
    }

    pub fn with_base_urls(ctx: AdapterContext, api_base: Url, auth_base: Url) -> Self {
        Self {
            ctx,
            api_base,
            auth_base,
        }
    }

    async fn token(&self) -> Result<String, SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        c.access_token()
            .map(str::to_string)
            .ok_or(SyncError::NotConnected(SERVICE))
    }

    fn endpoint(&self, path: &str, token: &str, params: &[(&str, String)]) -> Result<Url, SyncError> {
        let mut url = self
            .api_base
            .join(path)
            .map_err(|e| SyncError::malformed(format!("bad endpoint {path}: {e}")))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("oauth_token", token);
            q.append_pair("v", API_VERSION);
            for (k, v) in params {
                q.append_pair(k, v);
            }
        }
        Ok(url)
    }

    pub async fn search_venues(
        &self,
        token: &str,
        name: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<Venue>, SyncError> {
        let url = self.endpoint(
            "venues/search",
            token,
            &[
                ("ll", format!("{lat},{lon}")),
                ("query", name.to_string()),
                ("intent", "checkin".into()),
                ("limit", "10".into()),
            ],
        )?;
        let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
        let venues = body
            .pointer("/response/venues")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(venues)?)
    }

    async fn exchange_code(&self, code: &str) -> Result<(), SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        let (Some(client_id), Some(secret)) = (c.get(cred::CLIENT_ID), c.get(cred::CLIENT_SECRET))
        else {
            return Err(SyncError::NotConnected(SERVICE));
        };
        let mut url = self
            .auth_base
            .join("access_token")
            .map_err(|e| SyncError::malformed(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("client_secret", secret)
            .append_pair("grant_type", "authorization_code")
            .append_pair("redirect_uri", &self.ctx.redirect_uri(SERVICE))
            .append_pair("code", code);
        let token: TokenResponse = read_json(self.ctx.http.get(url).send().await?).await?;
        let access = token
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SyncError::Auth("token response without access_token".into()))?;

        let mut patch = CredentialPatch::default().set(cred::ACCESS_TOKEN, access.clone());
        match self.display_name(&access).await {
            Ok(Some(name)) => patch = patch.set(cred::DISPLAY_NAME, name),
            Ok(None) => {}
            Err(err) => debug!(?err, "could not fetch foursquare user"),
        }
        self.ctx.save(SERVICE, patch).await
    }

    async fn display_name(&self, token: &str) -> Result<Option<String>, SyncError> {
        let url = self.endpoint("users/self", token, &[])?;
        let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
        let user = body.pointer("/response/user");
        let first = user.and_then(|u| u.get("firstName")).and_then(json_str);
        let last = user.and_then(|u| u.get("lastName")).and_then(json_str);
        Ok(match (first, last) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(f), None) => Some(f),
            (None, l) => l,
        })
    }
}

pub fn build_auth_url(auth_base: &Url, client_id: &str, redirect_uri: &str, state: &str) -> String {
    let mut url = auth_base.join("authenticate").unwrap_or_else(|_| auth_base.clone());
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state);
    url.to_string()
}

/// Exact case-insensitive name match wins; otherwise the nearest result.
pub fn pick_venue<'a>(venues: &'a [Venue], name: &str, origin: (f64, f64)) -> Option<&'a Venue> {
    let wanted = name.trim().to_lowercase();
    if let Some(exact) = venues
        .iter()
        .find(|v| v.name.trim().to_lowercase() == wanted)
    {
        return Some(exact);
    }
    let distance = |v: &Venue| {
        v.location.distance.unwrap_or_else(|| match (v.location.lat, v.location.lng) {
            (Some(lat), Some(lng)) => haversine_m(origin, (lat, lng)),
            _ => f64::MAX,
        })
    };
    venues
        .iter()
        .min_by(|a, b| distance(a).total_cmp(&distance(b)))
}

fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let (lat1, lat2) = (a.0.to_radians(), b.0.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.1 - a.1).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub fn build_checkin_form(record: &ReactionRecord, venue_id: &str) -> Vec<(&'static str, String)> {
    let mut form = vec![("venueId", venue_id.to_string()), ("broadcast", "public".to_string())];
    let shout: String = record.content_note.trim().chars().take(SHOUT_MAX).collect();
    if !shout.is_empty() {
        form.push(("shout", shout));
    }
    if let Some((lat, lon)) = record.coordinates() {
        form.push(("ll", format!("{lat},{lon}")));
    }
    form
}

pub fn checkin_url(id: &str) -> String {
    format!("https://www.swarmapp.com/checkin/{id}")
}

/// Every element of the checkins page becomes an item; ones missing an id or
/// timestamp fail later in `to_record`.
pub fn parse_checkins(body: &Value) -> Vec<ExternalItem> {
    body.pointer("/response/checkins/items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let id = item.get("id").and_then(json_str).unwrap_or_default();
                    ExternalItem {
                        service: SERVICE,
                        url: (!id.is_empty()).then(|| checkin_url(&id)),
                        external_id: id,
                        occurred_at: created_at(item).unwrap_or_else(Utc::now),
                        payload: item.clone(),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn created_at(item: &Value) -> Option<DateTime<Utc>> {
    item.get("createdAt")
        .and_then(Value::as_i64)
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

#[async_trait]
impl ServiceAdapter for FoursquareAdapter {
    fn service(&self) -> Service {
        SERVICE
    }

    async fn is_connected(&self) -> bool {
        let c = self.ctx.credential_or_default(SERVICE).await;
        c.enabled() && c.access_token().is_some()
    }

    async fn auth_url(&self, state: &str) -> Option<String> {
        let c = self.ctx.credential_or_default(SERVICE).await;
        let client_id = c.get(cred::CLIENT_ID)?;
        Some(build_auth_url(
            &self.auth_base,
            client_id,
            &self.ctx.redirect_uri(SERVICE),
            state,
        ))
    }

    async fn handle_oauth_callback(&self, code: &str) -> bool {
        match self.exchange_code(code).await {
            Ok(()) => {
                info!("foursquare connected");
                true
            }
            Err(err) => {
                warn!(?err, "foursquare token exchange failed");
                false
            }
        }
    }

    async fn syndicate(&self, record: &ReactionRecord) -> Result<Syndicated, SyncError> {
        let token = self.token().await?;
        let mut resolved = Fields::new();
        let venue_id = match record.field(field::FOURSQUARE_VENUE_ID) {
            Some(id) => id.to_string(),
            None => {
                let name = record
                    .field(field::VENUE_NAME)
                    .ok_or_else(|| SyncError::Unresolvable("record has no venue name".into()))?;
                let (lat, lon) = record.coordinates().ok_or_else(|| {
                    SyncError::Unresolvable("record has no coordinates to search near".into())
                })?;
                let venues = self.search_venues(&token, name, lat, lon).await?;
                let venue = pick_venue(&venues, name, (lat, lon))
                    .ok_or_else(|| SyncError::Unresolvable(format!("no venue matching {name}")))?;
                debug!(venue_id = %venue.id, venue = %venue.name, "resolved foursquare venue");
                resolved.insert(field::FOURSQUARE_VENUE_ID.into(), venue.id.clone());
                venue.id.clone()
            }
        };

        let url = self.endpoint("checkins/add", &token, &[])?;
        let form = build_checkin_form(record, &venue_id);
        let body: Value = read_json(self.ctx.http.post(url).form(&form).send().await?).await?;
        let id = body
            .pointer("/response/checkin/id")
            .and_then(json_str)
            .ok_or_else(|| SyncError::malformed("checkin response without id"))?;
        Ok(Syndicated {
            url: Some(checkin_url(&id)),
            external_id: id,
            resolved,
        })
    }

    async fn fetch_recent_items(&self, limit: usize) -> Result<Vec<ExternalItem>, SyncError> {
        let token = self.token().await?;
        let mut items = Vec::new();
        let mut offset = 0usize;
        while items.len() < limit {
            let page = (limit - items.len()).min(PAGE_MAX);
            let url = self.endpoint(
                "users/self/checkins",
                &token,
                &[
                    ("limit", page.to_string()),
                    ("offset", offset.to_string()),
                    ("sort", "newestfirst".into()),
                ],
            )?;
            let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
            let batch = parse_checkins(&body);
            let got = batch.len();
            items.extend(batch);
            if got < page {
                break;
            }
            offset += got;
        }
        items.truncate(limit);
        Ok(items)
    }

    fn to_record(&self, item: &ExternalItem) -> Result<NewRecord, SyncError> {
        if item.external_id.is_empty() {
            return Err(SyncError::malformed("checkin without id"));
        }
        let p = &item.payload;
        let occurred_at =
            created_at(p).ok_or_else(|| SyncError::malformed("checkin without createdAt"))?;
        let venue = p.get("venue").cloned().unwrap_or(Value::Null);
        let name = venue
            .get("name")
            .and_then(json_str)
            .ok_or_else(|| SyncError::malformed("checkin without venue name"))?;
        let location = venue.get("location").cloned().unwrap_or(Value::Null);
        let loc = |key: &str| location.get(key).and_then(json_str).unwrap_or_default();

        let mut rec = NewRecord::new(Kind::Checkin, occurred_at);
        rec.set(field::VENUE_NAME, name);
        rec.set(field::ADDRESS, loc("address"));
        rec.set(field::LOCALITY, loc("city"));
        rec.set(field::REGION, loc("state"));
        rec.set(field::COUNTRY, loc("country"));
        rec.set(field::LATITUDE, loc("lat"));
        rec.set(field::LONGITUDE, loc("lng"));
        rec.set(
            field::FOURSQUARE_VENUE_ID,
            venue.get("id").and_then(json_str).unwrap_or_default(),
        );
        rec.content_note = p.get("shout").and_then(json_str).unwrap_or_default();
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn venue(id: &str, name: &str, distance: Option<f64>) -> Venue {
        Venue {
            id: id.into(),
            name: name.into(),
            location: VenueLocation {
                distance,
                ..Default::default()
            },
        }
    }

    fn record(note: &str) -> ReactionRecord {
        let mut fields = BTreeMap::new();
        fields.insert(field::VENUE_NAME.to_string(), "Tate Modern".to_string());
        fields.insert(field::LATITUDE.to_string(), "51.5076".to_string());
        fields.insert(field::LONGITUDE.to_string(), "-0.0994".to_string());
        ReactionRecord {
            id: "r".into(),
            kind: Kind::Checkin,
            fields,
            content_note: note.into(),
            status: crate::model::Status::Published,
            created_at: Utc::now(),
            published_at: None,
            imported_from: None,
            external_ids: BTreeMap::new(),
            syndication_urls: BTreeMap::new(),
        }
    }

    #[test]
    fn auth_url_carries_state_and_redirect() {
        let url = build_auth_url(
            &parse_base(AUTH_BASE),
            "cid",
            "https://blog.example.com/oauth/foursquare/callback",
            "st4te",
        );
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/oauth2/authenticate");
        let q: BTreeMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(q["client_id"], "cid");
        assert_eq!(q["state"], "st4te");
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["redirect_uri"], "https://blog.example.com/oauth/foursquare/callback");
    }

    #[test]
    fn pick_venue_prefers_exact_name() {
        let venues = vec![
            venue("near", "Tate Modern Cafe", Some(5.0)),
            venue("exact", "TATE MODERN", Some(80.0)),
        ];
        assert_eq!(pick_venue(&venues, "Tate Modern", (0.0, 0.0)).unwrap().id, "exact");
    }

    #[test]
    fn pick_venue_falls_back_to_nearest() {
        let venues = vec![
            venue("far", "Bankside Gallery", Some(300.0)),
            venue("near", "Switch House", Some(20.0)),
            venue("unknown", "Somewhere", None),
        ];
        assert_eq!(pick_venue(&venues, "Tate Modern", (0.0, 0.0)).unwrap().id, "near");
        assert!(pick_venue(&[], "Tate Modern", (0.0, 0.0)).is_none());
    }

    #[test]
    fn checkin_form_truncates_shout() {
        let long = "x".repeat(200);
        let form = build_checkin_form(&record(&long), "v1");
        let get = |k: &str| form.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());
        assert_eq!(get("venueId").as_deref(), Some("v1"));
        assert_eq!(get("shout").unwrap().len(), SHOUT_MAX);
        assert_eq!(get("ll").as_deref(), Some("51.5076,-0.0994"));

        let form = build_checkin_form(&record("  "), "v1");
        assert!(form.iter().all(|(k, _)| *k != "shout"));
    }

    #[test]
    fn parse_and_map_checkins() {
        let body = json!({
            "meta": { "code": 200 },
            "response": { "checkins": { "count": 2, "items": [
                {
                    "id": "c1",
                    "createdAt": 1714564800,
                    "shout": "flat white",
                    "venue": {
                        "id": "v1",
                        "name": "Monmouth Coffee",
                        "location": { "address": "27 Monmouth St", "city": "London",
                                      "state": "Greater London", "country": "United Kingdom",
                                      "lat": 51.5142, "lng": -0.1269 }
                    }
                },
                { "createdAt": 1714564000, "venue": { "name": "No Id" } }
            ]}}
        });
        let items = parse_checkins(&body);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].external_id, "c1");
        assert_eq!(items[0].url.as_deref(), Some("https://www.swarmapp.com/checkin/c1"));

        let adapter = FoursquareAdapter::new(crate::adapters::testing::test_ctx());
        let rec = adapter.to_record(&items[0]).unwrap();
        assert_eq!(rec.kind, Kind::Checkin);
        assert_eq!(rec.field(field::VENUE_NAME), Some("Monmouth Coffee"));
        assert_eq!(rec.field(field::LOCALITY), Some("London"));
        assert_eq!(rec.field(field::LATITUDE), Some("51.5142"));
        assert_eq!(rec.field(field::FOURSQUARE_VENUE_ID), Some("v1"));
        assert_eq!(rec.content_note, "flat white");
        assert_eq!(rec.occurred_at.timestamp(), 1714564800);

        assert!(matches!(
            adapter.to_record(&items[1]),
            Err(SyncError::Malformed(_))
        ));
    }
}
