use super::{
    json_str, parse_base, read_json, synthesize_id, AdapterContext, ExternalItem, ServiceAdapter,
    Syndicated,
};
use crate::error::SyncError;
use crate::model::{
    cred, field, Credential, CredentialPatch, Fields, Kind, NewRecord, ReactionRecord, Service,
};
use crate::store::name_key;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.trakt.tv/";
const AUTH_BASE: &str = "https://trakt.tv/";
const PAGE_MAX: usize = 100;
const SERVICE: Service = Service::Trakt;

#[derive(Clone)]
pub struct TraktAdapter {
    ctx: AdapterContext,
    api_base: Url,
    auth_base: Url,
    /// Refresh tokens are single use; one refresh at a time.
    refresh_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for TraktAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraktAdapter")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    created_at: Option<i64>,
}

impl TokenResponse {
    fn into_patch(self) -> Result<CredentialPatch, SyncError> {
        let access = self
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SyncError::Auth("token response without access_token".into()))?;
        let mut patch = CredentialPatch::default().set(cred::ACCESS_TOKEN, access);
        if let Some(refresh) = self.refresh_token.filter(|t| !t.trim().is_empty()) {
            patch = patch.set(cred::REFRESH_TOKEN, refresh);
        }
        if let Some(expires_in) = self.expires_in {
            let issued = self.created_at.unwrap_or_else(|| Utc::now().timestamp());
            patch = patch.set(cred::TOKEN_EXPIRES_AT, (issued + expires_in).to_string());
        }
        Ok(patch)
    }
}

/// Authenticated request material.
struct Session {
    client_id: String,
    token: String,
}

fn stored_session(c: &Credential) -> Result<Session, SyncError> {
    let client_id = c
        .get(cred::CLIENT_ID)
        .map(str::to_string)
        .ok_or(SyncError::NotConnected(SERVICE))?;
    let token = c
        .access_token()
        .map(str::to_string)
        .ok_or(SyncError::NotConnected(SERVICE))?;
    Ok(Session { client_id, token })
}

impl TraktAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self::with_base_urls(ctx, parse_base(API_BASE), parse_base(AUTH_BASE))
    }

    pub fn with_base_urls(ctx: AdapterContext, api_base: Url, auth_base: Url) -> Self {
        Self {
            ctx,
            api_base,
            auth_base,
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.api_base
            .join(path)
            .map_err(|e| SyncError::malformed(format!("bad endpoint {path}: {e}")))
    }

    fn authed(&self, req: RequestBuilder, session: &Session) -> RequestBuilder {
        req.header("trakt-api-version", "2")
            .header("trakt-api-key", session.client_id.as_str())
            .bearer_auth(&session.token)
    }

    /// Current token, refreshed first when it has expired.
    async fn session(&self) -> Result<Session, SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        let current = stored_session(&c)?;
        if !c.token_expired(Utc::now()) {
            return Ok(current);
        }

        let _refreshing = self.refresh_lock.lock().await;
        // Whoever held the lock may already have rotated the token.
        let c = self.ctx.credential(SERVICE).await?;
        let Session { client_id, token } = stored_session(&c)?;
        if !c.token_expired(Utc::now()) {
            debug!("trakt token already refreshed");
            return Ok(Session { client_id, token });
        }
        let refresh = c
            .get(cred::REFRESH_TOKEN)
            .ok_or(SyncError::NotConnected(SERVICE))?;
        let secret = c
            .get(cred::CLIENT_SECRET)
            .ok_or(SyncError::NotConnected(SERVICE))?;
        debug!("refreshing trakt token");
        let body = json!({
            "refresh_token": refresh,
            "client_id": client_id,
            "client_secret": secret,
            "redirect_uri": self.ctx.redirect_uri(SERVICE),
            "grant_type": "refresh_token",
        });
        let res = self.ctx.http.post(self.url("oauth/token")?).json(&body).send().await?;
        let token: TokenResponse = read_json(res).await?;
        let patch = token.into_patch()?;
        let access = patch
            .values
            .get(cred::ACCESS_TOKEN)
            .cloned()
            .flatten()
            .unwrap_or_default();
        self.ctx.save(SERVICE, patch).await?;
        info!("trakt token refreshed");
        Ok(Session {
            client_id,
            token: access,
        })
    }

    async fn exchange_code(&self, code: &str) -> Result<(), SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        let (Some(client_id), Some(secret)) = (c.get(cred::CLIENT_ID), c.get(cred::CLIENT_SECRET))
        else {
            return Err(SyncError::NotConnected(SERVICE));
        };
        let body = json!({
            "code": code,
            "client_id": client_id,
            "client_secret": secret,
            "redirect_uri": self.ctx.redirect_uri(SERVICE),
            "grant_type": "authorization_code",
        });
        let res = self.ctx.http.post(self.url("oauth/token")?).json(&body).send().await?;
        let token: TokenResponse = read_json(res).await?;
        let mut patch = token.into_patch()?;

        let session = Session {
            client_id: client_id.to_string(),
            token: patch
                .values
                .get(cred::ACCESS_TOKEN)
                .cloned()
                .flatten()
                .unwrap_or_default(),
        };
        match self.user_name(&session).await {
            Ok(Some(name)) => patch = patch.set(cred::DISPLAY_NAME, name),
            Ok(None) => {}
            Err(err) => debug!(?err, "could not fetch trakt settings"),
        }
        self.ctx.save(SERVICE, patch).await
    }

    async fn user_name(&self, session: &Session) -> Result<Option<String>, SyncError> {
        let req = self.authed(self.ctx.http.get(self.url("users/settings")?), session);
        let body: Value = read_json(req.send().await?).await?;
        Ok(body
            .pointer("/user/ids/slug")
            .or_else(|| body.pointer("/user/username"))
            .and_then(json_str))
    }

    /// Ratings are extra; a failure here never fails the history write.
    async fn rate(&self, session: &Session, record: &ReactionRecord) {
        let Some(body) = build_rating_body(record) else {
            return;
        };
        let res = match self.url("sync/ratings") {
            Ok(url) => self.authed(self.ctx.http.post(url), session).json(&body).send().await,
            Err(err) => {
                debug!(?err, "skipping trakt rating");
                return;
            }
        };
        match res {
            Ok(r) if r.status().is_success() => debug!("trakt rating stored"),
            Ok(r) => debug!(status = %r.status(), "trakt rating rejected"),
            Err(err) => debug!(?err, "trakt rating failed"),
        }
    }
}

pub fn build_auth_url(auth_base: &Url, client_id: &str, redirect_uri: &str, state: &str) -> String {
    let mut url = auth_base
        .join("oauth/authorize")
        .unwrap_or_else(|_| auth_base.clone());
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state);
    url.to_string()
}

fn is_episode(media_type: Option<&str>) -> bool {
    matches!(media_type, Some("episode" | "show" | "tv"))
}

/// Id shared by both directions. Titles are compared by [`name_key`].
pub fn watch_id(
    media_type: &str,
    title: &str,
    season: Option<&str>,
    episode: Option<&str>,
    at: DateTime<Utc>,
) -> String {
    synthesize_id(&[
        media_type,
        &name_key(title),
        season.unwrap_or(""),
        episode.unwrap_or(""),
        &at.timestamp().to_string(),
    ])
}

fn ids_object(record: &ReactionRecord) -> Map<String, Value> {
    let mut ids = Map::new();
    if let Some(id) = record.field(field::TRAKT_ID).and_then(|v| v.parse::<u64>().ok()) {
        ids.insert("trakt".into(), id.into());
    }
    if let Some(id) = record.field(field::TMDB_ID).and_then(|v| v.parse::<u64>().ok()) {
        ids.insert("tmdb".into(), id.into());
    }
    if let Some(id) = record.field(field::IMDB_ID) {
        ids.insert("imdb".into(), id.into());
    }
    ids
}

fn media_object(record: &ReactionRecord) -> Result<Map<String, Value>, SyncError> {
    let title = record
        .field(field::TITLE)
        .ok_or_else(|| SyncError::Unresolvable("record has no title".into()))?;
    let mut obj = Map::new();
    obj.insert("title".into(), title.into());
    if let Some(year) = record.field(field::YEAR).and_then(|v| v.parse::<u32>().ok()) {
        obj.insert("year".into(), year.into());
    }
    let ids = ids_object(record);
    if !ids.is_empty() {
        obj.insert("ids".into(), Value::Object(ids));
    }
    Ok(obj)
}

/// Body for `POST sync/history`. Episodes go under their show.
pub fn build_history_body(record: &ReactionRecord) -> Result<Value, SyncError> {
    let watched_at = record
        .occurred_at()
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut media = media_object(record)?;
    if is_episode(record.field(field::MEDIA_TYPE)) {
        let season = record
            .field(field::SEASON)
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| SyncError::Unresolvable("episode without season".into()))?;
        let episode = record
            .field(field::EPISODE)
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| SyncError::Unresolvable("episode without number".into()))?;
        media.insert(
            "seasons".into(),
            json!([{ "number": season, "episodes": [{ "number": episode, "watched_at": watched_at }] }]),
        );
        Ok(json!({ "shows": [media] }))
    } else {
        media.insert("watched_at".into(), watched_at.into());
        Ok(json!({ "movies": [media] }))
    }
}

/// Body for `POST sync/ratings`, when the record carries a 1..=10 rating.
pub fn build_rating_body(record: &ReactionRecord) -> Option<Value> {
    let rating = record
        .field(field::RATING)
        .and_then(|v| v.parse::<f64>().ok())
        .map(|r| r.round() as i64)
        .filter(|r| (1..=10).contains(r))?;
    let mut media = media_object(record).ok()?;
    if is_episode(record.field(field::MEDIA_TYPE)) {
        let season = record.field(field::SEASON)?.parse::<u32>().ok()?;
        let episode = record.field(field::EPISODE)?.parse::<u32>().ok()?;
        media.insert(
            "seasons".into(),
            json!([{ "number": season, "episodes": [{ "number": episode, "rating": rating }] }]),
        );
        Some(json!({ "shows": [media] }))
    } else {
        media.insert("rating".into(), rating.into());
        Some(json!({ "movies": [media] }))
    }
}

/// Count of items Trakt reports as added.
pub fn added_count(body: &Value) -> u64 {
    body.get("added")
        .and_then(Value::as_object)
        .map(|added| added.values().filter_map(Value::as_u64).sum())
        .unwrap_or(0)
}

fn watched_at(item: &Value) -> Option<DateTime<Utc>> {
    item.get("watched_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn slug_url(item: &Value) -> Option<String> {
    match item.get("type").and_then(Value::as_str)? {
        "movie" => {
            let slug = item.pointer("/movie/ids/slug").and_then(json_str)?;
            Some(format!("https://trakt.tv/movies/{slug}"))
        }
        "episode" => {
            let slug = item.pointer("/show/ids/slug").and_then(json_str)?;
            let season = item.pointer("/episode/season").and_then(json_str)?;
            let number = item.pointer("/episode/number").and_then(json_str)?;
            Some(format!(
                "https://trakt.tv/shows/{slug}/seasons/{season}/episodes/{number}"
            ))
        }
        _ => None,
    }
}

/// A page of `sync/history`. Items lacking a title or timestamp keep an empty id.
pub fn parse_history(body: &Value) -> Vec<ExternalItem> {
    body.as_array()
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let at = watched_at(item);
                    let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
                    let (title, season, episode) = match kind {
                        "movie" => (item.pointer("/movie/title").and_then(json_str), None, None),
                        "episode" => (
                            item.pointer("/show/title").and_then(json_str),
                            item.pointer("/episode/season").and_then(json_str),
                            item.pointer("/episode/number").and_then(json_str),
                        ),
                        _ => (None, None, None),
                    };
                    let external_id = match (at, title) {
                        (Some(at), Some(title)) => {
                            watch_id(kind, &title, season.as_deref(), episode.as_deref(), at)
                        }
                        _ => String::new(),
                    };
                    ExternalItem {
                        service: SERVICE,
                        external_id,
                        occurred_at: at.unwrap_or_else(Utc::now),
                        url: slug_url(item),
                        payload: item.clone(),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ServiceAdapter for TraktAdapter {
    fn service(&self) -> Service {
        SERVICE
    }

    async fn is_connected(&self) -> bool {
        let c = self.ctx.credential_or_default(SERVICE).await;
        c.enabled() && c.get(cred::CLIENT_ID).is_some() && c.access_token().is_some()
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
                info!("trakt connected");
                true
            }
            Err(err) => {
                warn!(?err, "trakt token exchange failed");
                false
            }
        }
    }

    async fn syndicate(&self, record: &ReactionRecord) -> Result<Syndicated, SyncError> {
        let body = build_history_body(record)?;
        let session = self.session().await?;
        let req = self.authed(self.ctx.http.post(self.url("sync/history")?), &session);
        let res: Value = read_json(req.json(&body).send().await?).await?;
        if added_count(&res) == 0 {
            return Err(SyncError::Unresolvable(format!(
                "trakt matched nothing: {}",
                res.get("not_found").cloned().unwrap_or(Value::Null)
            )));
        }
        self.rate(&session, record).await;

        let media_type = if is_episode(record.field(field::MEDIA_TYPE)) {
            "episode"
        } else {
            "movie"
        };
        let title = record.field(field::TITLE).unwrap_or_default();
        let user = self
            .ctx
            .credential_or_default(SERVICE)
            .await
            .get(cred::DISPLAY_NAME)
            .map(str::to_string);
        Ok(Syndicated {
            external_id: watch_id(
                media_type,
                title,
                record.field(field::SEASON),
                record.field(field::EPISODE),
                record.occurred_at(),
            ),
            url: user.map(|u| format!("https://trakt.tv/users/{u}/history")),
            resolved: Fields::new(),
        })
    }

    async fn fetch_recent_items(&self, limit: usize) -> Result<Vec<ExternalItem>, SyncError> {
        let session = self.session().await?;
        let per_page = limit.clamp(1, PAGE_MAX);
        let mut items = Vec::new();
        let mut page = 1usize;
        while items.len() < limit {
            let mut url = self.url("sync/history")?;
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("limit", &per_page.to_string());
            let res = self.authed(self.ctx.http.get(url), &session).send().await?;
            let body: Value = read_json(res).await?;
            let batch = parse_history(&body);
            let got = batch.len();
            items.extend(batch);
            if got < per_page {
                break;
            }
            page += 1;
        }
        items.truncate(limit);
        Ok(items)
    }

    fn to_record(&self, item: &ExternalItem) -> Result<NewRecord, SyncError> {
        if item.external_id.is_empty() {
            return Err(SyncError::malformed("history item without title or watched_at"));
        }
        let p = &item.payload;
        let text = |ptr: &str| p.pointer(ptr).and_then(json_str).unwrap_or_default();
        let mut rec = NewRecord::new(Kind::Watch, item.occurred_at);
        match p.get("type").and_then(Value::as_str) {
            Some("episode") => {
                rec.set(field::MEDIA_TYPE, "episode");
                rec.set(field::TITLE, text("/show/title"));
                rec.set(field::YEAR, text("/show/year"));
                rec.set(field::SEASON, text("/episode/season"));
                rec.set(field::EPISODE, text("/episode/number"));
                rec.set(field::EPISODE_TITLE, text("/episode/title"));
                rec.set(field::TRAKT_ID, text("/show/ids/trakt"));
                rec.set(field::TMDB_ID, text("/show/ids/tmdb"));
                rec.set(field::IMDB_ID, text("/show/ids/imdb"));
            }
            _ => {
                rec.set(field::MEDIA_TYPE, "movie");
                rec.set(field::TITLE, text("/movie/title"));
                rec.set(field::YEAR, text("/movie/year"));
                rec.set(field::TRAKT_ID, text("/movie/ids/trakt"));
                rec.set(field::TMDB_ID, text("/movie/ids/tmdb"));
                rec.set(field::IMDB_ID, text("/movie/ids/imdb"));
            }
        }
        rec.set(field::URL, item.url.clone().unwrap_or_default());
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn record(fields: &[(&str, &str)]) -> ReactionRecord {
        ReactionRecord {
            id: "w1".into(),
            kind: Kind::Watch,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            content_note: String::new(),
            status: crate::model::Status::Published,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 21, 30, 0).unwrap(),
            published_at: None,
            imported_from: None,
            external_ids: BTreeMap::new(),
            syndication_urls: BTreeMap::new(),
        }
    }

    #[test]
    fn movie_history_body() {
        let body = build_history_body(&record(&[
            (field::TITLE, "Arrival"),
            (field::YEAR, "2016"),
            (field::TMDB_ID, "329865"),
        ]))
        .unwrap();
        assert_eq!(
            body,
            json!({ "movies": [{
                "title": "Arrival",
                "year": 2016,
                "ids": { "tmdb": 329865 },
                "watched_at": "2024-05-01T21:30:00Z"
            }]})
        );
    }

    #[test]
    fn episode_history_body_nests_under_show() {
        let body = build_history_body(&record(&[
            (field::TITLE, "Severance"),
            (field::MEDIA_TYPE, "episode"),
            (field::SEASON, "1"),
            (field::EPISODE, "3"),
        ]))
        .unwrap();
        assert_eq!(
            body["shows"][0]["seasons"][0]["episodes"][0],
            json!({ "number": 3, "watched_at": "2024-05-01T21:30:00Z" })
        );
        assert!(matches!(
            build_history_body(&record(&[(field::TITLE, "X"), (field::MEDIA_TYPE, "episode")])),
            Err(SyncError::Unresolvable(_))
        ));
    }

    #[test]
    fn rating_body_only_for_valid_ratings() {
        let body = build_rating_body(&record(&[(field::TITLE, "Arrival"), (field::RATING, "9")]));
        assert_eq!(body.unwrap()["movies"][0]["rating"], json!(9));
        assert!(build_rating_body(&record(&[(field::TITLE, "Arrival"), (field::RATING, "0")])).is_none());
        assert!(build_rating_body(&record(&[(field::TITLE, "Arrival")])).is_none());
    }

    #[test]
    fn added_count_sums_all_buckets() {
        assert_eq!(added_count(&json!({ "added": { "movies": 0, "episodes": 2 } })), 2);
        assert_eq!(added_count(&json!({ "added": { "movies": 0, "episodes": 0 } })), 0);
        assert_eq!(added_count(&json!({})), 0);
    }

    #[test]
    fn history_parsing_matches_syndicated_ids() {
        let body = json!([
            {
                "id": 1, "watched_at": "2024-05-01T21:30:00.000Z", "action": "watch", "type": "episode",
                "episode": { "season": 1, "number": 3, "title": "In Perpetuity", "ids": { "trakt": 9 } },
                "show": { "title": "Severance", "year": 2022, "ids": { "trakt": 7, "slug": "severance", "tmdb": 95396 } }
            },
            {
                "id": 2, "watched_at": "2024-04-30T20:00:00.000Z", "action": "watch", "type": "movie",
                "movie": { "title": "Arrival", "year": 2016, "ids": { "slug": "arrival-2016", "imdb": "tt2543164" } }
            },
            { "id": 3, "type": "movie", "movie": { "title": "No Date" } }
        ]);
        let items = parse_history(&body);
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[0].url.as_deref(),
            Some("https://trakt.tv/shows/severance/seasons/1/episodes/3")
        );
        assert!(items[2].external_id.is_empty());

        // The same watch syndicated from a local record yields the same id.
        let local = record(&[
            (field::TITLE, "severance"),
            (field::MEDIA_TYPE, "episode"),
            (field::SEASON, "1"),
            (field::EPISODE, "3"),
        ]);
        assert_eq!(
            items[0].external_id,
            watch_id("episode", "Severance", Some("1"), Some("3"), local.occurred_at())
        );

        let adapter = TraktAdapter::new(crate::adapters::testing::test_ctx());
        let ep = adapter.to_record(&items[0]).unwrap();
        assert_eq!(ep.kind, Kind::Watch);
        assert_eq!(ep.field(field::TITLE), Some("Severance"));
        assert_eq!(ep.field(field::EPISODE_TITLE), Some("In Perpetuity"));
        assert_eq!(ep.field(field::TMDB_ID), Some("95396"));
        let movie = adapter.to_record(&items[1]).unwrap();
        assert_eq!(movie.field(field::MEDIA_TYPE), Some("movie"));
        assert_eq!(movie.field(field::IMDB_ID), Some("tt2543164"));
        assert!(adapter.to_record(&items[2]).is_err());
    }

    #[test]
    fn token_response_sets_expiry() {
        let token = TokenResponse {
            access_token: Some("at".into()),
            refresh_token: Some("rt".into()),
            expires_in: Some(7_776_000),
            created_at: Some(1_700_000_000),
        };
        let patch = token.into_patch().unwrap();
        assert_eq!(
            patch.values.get(cred::TOKEN_EXPIRES_AT).cloned().flatten().as_deref(),
            Some("1707776000")
        );
        let empty = TokenResponse {
            access_token: Some(" ".into()),
            refresh_token: None,
            expires_in: None,
            created_at: None,
        };
        assert!(matches!(empty.into_patch(), Err(SyncError::Auth(_))));
    }
}
