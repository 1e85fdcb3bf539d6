use super::{
    json_str, parse_base, synthesize_id, AdapterContext, ExternalItem, ServiceAdapter, Syndicated,
};
use crate::error::SyncError;
use crate::model::{
    cred, field, Credential, CredentialPatch, Fields, Kind, NewRecord, ReactionRecord, Service,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use md5::{Digest, Md5};
use reqwest::Url;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://ws.audioscrobbler.com/2.0/";
const AUTH_BASE: &str = "https://www.last.fm/api/auth/";
const PAGE_MAX: usize = 200;
const SERVICE: Service = Service::Lastfm;

#[derive(Clone)]
pub struct LastfmAdapter {
    ctx: AdapterContext,
    api_base: Url,
    auth_base: Url,
}

impl fmt::Debug for LastfmAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LastfmAdapter")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// API key + shared secret; every signed call needs both.
struct Keys {
    api_key: String,
    secret: String,
}

impl Keys {
    fn from_credential(c: &Credential) -> Option<Self> {
        Some(Self {
            api_key: c.get(cred::API_KEY)?.to_string(),
            secret: c.get(cred::SHARED_SECRET)?.to_string(),
        })
    }
}

impl LastfmAdapter {
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

    /// Issues one API call. Signed calls get `api_sig`; all get `format=json`.
    async fn call(
        &self,
        keys: &Keys,
        mut params: BTreeMap<&'static str, String>,
        signed: bool,
        post: bool,
    ) -> Result<Value, SyncError> {
        params.insert("api_key", keys.api_key.clone());
        if signed {
            params.insert("api_sig", sign(&params, &keys.secret));
        }
        params.insert("format", "json".into());

        let res = if post {
            self.ctx.http.post(self.api_base.clone()).form(&params).send().await?
        } else {
            self.ctx.http.get(self.api_base.clone()).query(&params).send().await?
        };
        // Last.fm reports API errors as JSON bodies, often with a 4xx status.
        let status = res.status();
        let text = res.text().await?;
        if let Ok(body) = serde_json::from_str::<Value>(&text) {
            if let Some(err) = api_error(&body) {
                return Err(err);
            }
            if status.is_success() {
                return Ok(body);
            }
        }
        Err(SyncError::from_status(status, &text))
    }

    async fn exchange_token(&self, token: &str) -> Result<(), SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        let keys = Keys::from_credential(&c).ok_or(SyncError::NotConnected(SERVICE))?;
        let params = BTreeMap::from([
            ("method", "auth.getSession".to_string()),
            ("token", token.to_string()),
        ]);
        let body = self.call(&keys, params, true, false).await?;
        let key = body
            .pointer("/session/key")
            .and_then(json_str)
            .ok_or_else(|| SyncError::Auth("session response without key".into()))?;
        let mut patch = CredentialPatch::default().set(cred::ACCESS_TOKEN, key);
        if let Some(name) = body.pointer("/session/name").and_then(json_str) {
            patch = patch.set(cred::DISPLAY_NAME, name);
        }
        self.ctx.save(SERVICE, patch).await
    }

    async fn session(&self) -> Result<(Keys, String, Credential), SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        let keys = Keys::from_credential(&c).ok_or(SyncError::NotConnected(SERVICE))?;
        let sk = c
            .access_token()
            .map(str::to_string)
            .ok_or(SyncError::NotConnected(SERVICE))?;
        Ok((keys, sk, c))
    }
}

/// `md5(k1 v1 k2 v2 ... secret)` over the sorted params, excluding `format`
/// and `callback`.
pub fn signature_base(params: &BTreeMap<&str, String>, secret: &str) -> String {
    let mut base = String::new();
    for (k, v) in params {
        if matches!(*k, "format" | "callback" | "api_sig") {
            continue;
        }
        base.push_str(k);
        base.push_str(v);
    }
    base.push_str(secret);
    base
}

pub fn sign(params: &BTreeMap<&str, String>, secret: &str) -> String {
    hex::encode(Md5::digest(signature_base(params, secret).as_bytes()))
}

/// Maps a Last.fm `{"error": n, "message": ..}` body into the taxonomy.
pub fn api_error(body: &Value) -> Option<SyncError> {
    let code = body.get("error")?.as_i64()?;
    let message = body
        .get("message")
        .and_then(json_str)
        .unwrap_or_default();
    let msg = format!("last.fm error {code}: {message}");
    Some(match code {
        // invalid/expired token or session, invalid key, unauthorized
        4 | 9 | 10 | 14 | 15 | 26 => SyncError::Auth(msg),
        // service offline, temporary error, rate limit
        11 | 16 | 29 => SyncError::Transient(msg),
        6 | 7 => SyncError::Unresolvable(msg),
        _ => SyncError::Malformed(msg),
    })
}

pub fn build_auth_url(auth_base: &Url, api_key: &str, callback: &str) -> String {
    let mut url = auth_base.clone();
    url.query_pairs_mut()
        .append_pair("api_key", api_key)
        .append_pair("cb", callback);
    url.to_string()
}

/// Callback URL Last.fm redirects to; it appends `token` itself, so the CSRF
/// state has to ride along on the callback.
fn callback_with_state(redirect_uri: &str, state: &str) -> String {
    match Url::parse(redirect_uri) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("state", state);
            url.to_string()
        }
        Err(_) => redirect_uri.to_string(),
    }
}

pub fn track_url(artist: &str, track: &str) -> String {
    let mut url = parse_base("https://www.last.fm/");
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().extend(["music", artist, "_", track]);
    }
    url.to_string()
}

/// Id shared by both directions so an imported scrobble matches its syndicated twin.
pub fn scrobble_id(artist: &str, track: &str, at: DateTime<Utc>) -> String {
    synthesize_id(&[artist, track, &at.timestamp().to_string()])
}

pub fn build_scrobble_params(record: &ReactionRecord) -> Result<BTreeMap<&'static str, String>, SyncError> {
    let track = record
        .field(field::TRACK)
        .ok_or_else(|| SyncError::Unresolvable("record has no track".into()))?;
    let artist = record
        .field(field::ARTIST)
        .ok_or_else(|| SyncError::Unresolvable("record has no artist".into()))?;
    let mut params = BTreeMap::from([
        ("method", "track.scrobble".to_string()),
        ("artist", artist.to_string()),
        ("track", track.to_string()),
        ("timestamp", record.occurred_at().timestamp().to_string()),
    ]);
    if let Some(album) = record.field(field::ALBUM) {
        params.insert("album", album.to_string());
    }
    if let Some(duration) = record
        .field(field::DURATION)
        .and_then(|d| d.parse::<u32>().ok())
    {
        params.insert("duration", duration.to_string());
    }
    if let Some(mbid) = record.field(field::TRACK_MBID) {
        params.insert("mbid", mbid.to_string());
    }
    Ok(params)
}

fn played_at(track: &Value) -> Option<DateTime<Utc>> {
    track
        .pointer("/date/uts")
        .and_then(json_str)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

fn text_of(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::Object(o) => o.get("#text").and_then(json_str),
        other => json_str(other),
    }
}

/// One page of `user.getrecenttracks`, minus the now-playing entry, plus the
/// total page count.
pub fn parse_recent_tracks(body: &Value) -> (Vec<ExternalItem>, usize) {
    let tracks = match body.pointer("/recenttracks/track") {
        Some(Value::Array(items)) => items.clone(),
        // A single result comes back as an object.
        Some(obj @ Value::Object(_)) => vec![obj.clone()],
        _ => Vec::new(),
    };
    let pages = body
        .pointer("/recenttracks/@attr/totalPages")
        .and_then(json_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let items = tracks
        .into_iter()
        .filter(|t| {
            t.pointer("/@attr/nowplaying").and_then(Value::as_str) != Some("true")
        })
        .map(|t| {
            let artist = text_of(t.get("artist")).unwrap_or_default();
            let name = t.get("name").and_then(json_str).unwrap_or_default();
            let at = played_at(&t);
            let external_id = match at {
                Some(at) if !artist.is_empty() && !name.is_empty() => scrobble_id(&artist, &name, at),
                _ => String::new(),
            };
            ExternalItem {
                service: SERVICE,
                external_id,
                occurred_at: at.unwrap_or_else(Utc::now),
                url: t.get("url").and_then(json_str),
                payload: t,
            }
        })
        .collect();
    (items, pages)
}

#[async_trait]
impl ServiceAdapter for LastfmAdapter {
    fn service(&self) -> Service {
        SERVICE
    }

    async fn is_connected(&self) -> bool {
        let c = self.ctx.credential_or_default(SERVICE).await;
        c.enabled() && Keys::from_credential(&c).is_some() && c.access_token().is_some()
    }

    async fn auth_url(&self, state: &str) -> Option<String> {
        let c = self.ctx.credential_or_default(SERVICE).await;
        let api_key = c.get(cred::API_KEY)?;
        let callback = callback_with_state(&self.ctx.redirect_uri(SERVICE), state);
        Some(build_auth_url(&self.auth_base, api_key, &callback))
    }

    async fn handle_oauth_callback(&self, code: &str) -> bool {
        match self.exchange_token(code).await {
            Ok(()) => {
                info!("last.fm connected");
                true
            }
            Err(err) => {
                warn!(?err, "last.fm session exchange failed");
                false
            }
        }
    }

    async fn syndicate(&self, record: &ReactionRecord) -> Result<Syndicated, SyncError> {
        let (keys, sk, _) = self.session().await?;
        let mut params = build_scrobble_params(record)?;
        let artist = params["artist"].clone();
        let track = params["track"].clone();
        params.insert("sk", sk);

        let body = self.call(&keys, params, true, true).await?;
        let accepted = body
            .pointer("/scrobbles/@attr/accepted")
            .and_then(json_str)
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        if accepted == 0 {
            let reason = body
                .pointer("/scrobbles/scrobble/ignoredMessage/#text")
                .and_then(json_str)
                .unwrap_or_else(|| "scrobble ignored".into());
            return Err(SyncError::Unresolvable(reason));
        }
        debug!(%artist, %track, "scrobbled");
        Ok(Syndicated {
            external_id: scrobble_id(&artist, &track, record.occurred_at()),
            url: Some(
                record
                    .field(field::URL)
                    .map(str::to_string)
                    .unwrap_or_else(|| track_url(&artist, &track)),
            ),
            resolved: Fields::new(),
        })
    }

    async fn fetch_recent_items(&self, limit: usize) -> Result<Vec<ExternalItem>, SyncError> {
        let (keys, _, c) = self.session().await?;
        let user = c
            .get(cred::USERNAME)
            .or_else(|| c.get(cred::DISPLAY_NAME))
            .map(str::to_string)
            .ok_or(SyncError::NotConnected(SERVICE))?;
        let per_page = limit.clamp(1, PAGE_MAX);
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let params = BTreeMap::from([
                ("method", "user.getrecenttracks".to_string()),
                ("user", user.clone()),
                ("limit", per_page.to_string()),
                ("page", page.to_string()),
            ]);
            let body = self.call(&keys, params, false, false).await?;
            let (batch, pages) = parse_recent_tracks(&body);
            let empty = batch.is_empty();
            items.extend(batch);
            if empty || items.len() >= limit || page >= pages {
                break;
            }
            page += 1;
        }
        items.truncate(limit);
        Ok(items)
    }

    fn to_record(&self, item: &ExternalItem) -> Result<NewRecord, SyncError> {
        if item.external_id.is_empty() {
            return Err(SyncError::malformed("scrobble without artist, track or date"));
        }
        let p = &item.payload;
        let mut rec = NewRecord::new(Kind::Listen, item.occurred_at);
        rec.set(field::TRACK, p.get("name").and_then(json_str).unwrap_or_default());
        rec.set(field::ARTIST, text_of(p.get("artist")).unwrap_or_default());
        rec.set(field::ALBUM, text_of(p.get("album")).unwrap_or_default());
        rec.set(field::TRACK_MBID, p.get("mbid").and_then(json_str).unwrap_or_default());
        rec.set(
            field::ARTIST_MBID,
            p.pointer("/artist/mbid").and_then(json_str).unwrap_or_default(),
        );
        rec.set(field::URL, item.url.clone().unwrap_or_default());
        Ok(rec)
    }
}
