use super::{json_str, parse_base, read_json, AdapterContext, ExternalItem, ServiceAdapter, Syndicated};
use crate::error::SyncError;
use crate::model::{cred, field, CredentialPatch, Fields, Kind, NewRecord, ReactionRecord, Service};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

const API_BASE: &str = "https://api.untappd.com/v4/";
const AUTH_BASE: &str = "https://untappd.com/oauth/";
const PAGE_MAX: usize = 50;
const SHOUT_MAX: usize = 140;
const SERVICE: Service = Service::Untappd;

#[derive(Clone)]
pub struct UntappdAdapter {
    ctx: AdapterContext,
    api_base: Url,
    auth_base: Url,
}

impl fmt::Debug for UntappdAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UntappdAdapter")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// A beer search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beer {
    pub bid: String,
    pub name: String,
    pub brewery: Option<String>,
}

impl UntappdAdapter {
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
            q.append_pair("access_token", token);
            for (k, v) in params {
                q.append_pair(k, v);
            }
        }
        Ok(url)
    }

    pub async fn search_beer(&self, token: &str, query: &str) -> Result<Vec<Beer>, SyncError> {
        let url = self.endpoint(
            "search/beer",
            token,
            &[("q", query.to_string()), ("limit", "5".into())],
        )?;
        let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
        Ok(parse_beer_search(&body))
    }

    async fn exchange_code(&self, code: &str) -> Result<(), SyncError> {
        let c = self.ctx.credential(SERVICE).await?;
        let (Some(client_id), Some(secret)) = (c.get(cred::CLIENT_ID), c.get(cred::CLIENT_SECRET))
        else {
            return Err(SyncError::NotConnected(SERVICE));
        };
        let mut url = self
            .auth_base
            .join("authorize/")
            .map_err(|e| SyncError::malformed(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("client_secret", secret)
            .append_pair("response_type", "code")
            .append_pair("redirect_url", &self.ctx.redirect_uri(SERVICE))
            .append_pair("code", code);
        let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
        let access = body
            .pointer("/response/access_token")
            .and_then(json_str)
            .ok_or_else(|| SyncError::Auth("token response without access_token".into()))?;

        let mut patch = CredentialPatch::default().set(cred::ACCESS_TOKEN, access.clone());
        match self.user_name(&access).await {
            Ok(Some(name)) => patch = patch.set(cred::DISPLAY_NAME, name),
            Ok(None) => {}
            Err(err) => debug!(?err, "could not fetch untappd user"),
        }
        self.ctx.save(SERVICE, patch).await
    }

    async fn user_name(&self, token: &str) -> Result<Option<String>, SyncError> {
        let url = self.endpoint("user/info", token, &[("compact", "true".into())])?;
        let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
        Ok(body.pointer("/response/user/user_name").and_then(json_str))
    }
}

pub fn build_auth_url(auth_base: &Url, client_id: &str, redirect_uri: &str, state: &str) -> String {
    let mut url = auth_base
        .join("authenticate/")
        .unwrap_or_else(|_| auth_base.clone());
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_url", redirect_uri)
        .append_pair("state", state);
    url.to_string()
}

pub fn parse_beer_search(body: &Value) -> Vec<Beer> {
    body.pointer("/response/beers/items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let beer = item.get("beer")?;
                    Some(Beer {
                        bid: beer.get("bid").and_then(json_str)?,
                        name: beer.get("beer_name").and_then(json_str).unwrap_or_default(),
                        brewery: item.pointer("/brewery/brewery_name").and_then(json_str),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn build_checkin_form(record: &ReactionRecord, bid: &str) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("gmt_offset", "0".to_string()),
        ("timezone", "UTC".to_string()),
        ("bid", bid.to_string()),
    ];
    let shout: String = record.content_note.trim().chars().take(SHOUT_MAX).collect();
    if !shout.is_empty() {
        form.push(("shout", shout));
    }
    if let Some(rating) = record
        .field_f64(field::RATING)
        .filter(|r| *r > 0.0 && *r <= 5.0)
    {
        form.push(("rating", format!("{:.2}", (rating * 4.0).round() / 4.0)));
    }
    if let Some(venue) = record.field(field::FOURSQUARE_VENUE_ID) {
        form.push(("foursquare_id", venue.to_string()));
    }
    if let Some((lat, lon)) = record.coordinates() {
        form.push(("geolat", lat.to_string()));
        form.push(("geolng", lon.to_string()));
    }
    form
}

pub fn checkin_url(user: Option<&str>, id: &str) -> String {
    match user {
        Some(user) => format!("https://untappd.com/user/{user}/checkin/{id}"),
        None => format!("https://untappd.com/c/{id}"),
    }
}

fn created_at(item: &Value) -> Option<DateTime<Utc>> {
    item.get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// One page of `user/checkins`, plus the cursor for the next page.
pub fn parse_checkins(body: &Value) -> (Vec<ExternalItem>, Option<String>) {
    let items = body
        .pointer("/response/checkins/items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let id = item.get("checkin_id").and_then(json_str).unwrap_or_default();
                    let user = item.pointer("/user/user_name").and_then(json_str);
                    ExternalItem {
                        service: SERVICE,
                        url: (!id.is_empty()).then(|| checkin_url(user.as_deref(), &id)),
                        external_id: id,
                        occurred_at: created_at(item).unwrap_or_else(Utc::now),
                        payload: item.clone(),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let next = body
        .pointer("/response/pagination/max_id")
        .and_then(json_str);
    (items, next)
}

#[async_trait]
impl ServiceAdapter for UntappdAdapter {
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
                info!("untappd connected");
                true
            }
            Err(err) => {
                warn!(?err, "untappd token exchange failed");
                false
            }
        }
    }

    async fn syndicate(&self, record: &ReactionRecord) -> Result<Syndicated, SyncError> {
        let token = self.token().await?;
        let mut resolved = Fields::new();
        let bid = match record.field(field::UNTAPPD_BEER_ID) {
            Some(bid) => bid.to_string(),
            None => {
                let name = record
                    .field(field::BEER_NAME)
                    .ok_or_else(|| SyncError::Unresolvable("record has no beer name".into()))?;
                let query = match record.field(field::BREWERY) {
                    Some(brewery) => format!("{brewery} {name}"),
                    None => name.to_string(),
                };
                let beers = self.search_beer(&token, &query).await?;
                let top = beers
                    .into_iter()
                    .next()
                    .ok_or_else(|| SyncError::Unresolvable(format!("no beer matching {query}")))?;
                debug!(bid = %top.bid, beer = %top.name, "resolved untappd beer");
                resolved.insert(field::UNTAPPD_BEER_ID.into(), top.bid.clone());
                top.bid
            }
        };

        let url = self.endpoint("checkin/add", &token, &[])?;
        let form = build_checkin_form(record, &bid);
        let body: Value = read_json(self.ctx.http.post(url).form(&form).send().await?).await?;
        let id = body
            .pointer("/response/checkin_id")
            .and_then(json_str)
            .ok_or_else(|| SyncError::malformed("checkin response without checkin_id"))?;
        let user = self
            .ctx
            .credential_or_default(SERVICE)
            .await
            .get(cred::DISPLAY_NAME)
            .map(str::to_string);
        Ok(Syndicated {
            url: Some(checkin_url(user.as_deref(), &id)),
            external_id: id,
            resolved,
        })
    }

    async fn fetch_recent_items(&self, limit: usize) -> Result<Vec<ExternalItem>, SyncError> {
        let token = self.token().await?;
        let mut items = Vec::new();
        let mut max_id: Option<String> = None;
        while items.len() < limit {
            let page = (limit - items.len()).min(PAGE_MAX);
            let mut params = vec![("limit", page.to_string())];
            if let Some(cursor) = &max_id {
                params.push(("max_id", cursor.clone()));
            }
            let url = self.endpoint("user/checkins", &token, &params)?;
            let body: Value = read_json(self.ctx.http.get(url).send().await?).await?;
            let (batch, next) = parse_checkins(&body);
            let got = batch.len();
            items.extend(batch);
            match next {
                Some(next) if got == page && Some(&next) != max_id.as_ref() => max_id = Some(next),
                _ => break,
            }
        }
        items.truncate(limit);
        Ok(items)
    }

    fn to_record(&self, item: &ExternalItem) -> Result<NewRecord, SyncError> {
        if item.external_id.is_empty() {
            return Err(SyncError::malformed("checkin without checkin_id"));
        }
        let p = &item.payload;
        let occurred_at =
            created_at(p).ok_or_else(|| SyncError::malformed("checkin without created_at"))?;
        let beer_name = p
            .pointer("/beer/beer_name")
            .and_then(json_str)
            .ok_or_else(|| SyncError::malformed("checkin without beer name"))?;
        let text = |ptr: &str| p.pointer(ptr).and_then(json_str).unwrap_or_default();

        let mut rec = NewRecord::new(Kind::Checkin, occurred_at);
        rec.set(field::BEER_NAME, beer_name);
        rec.set(field::UNTAPPD_BEER_ID, text("/beer/bid"));
        rec.set(field::BEER_STYLE, text("/beer/beer_style"));
        rec.set(field::BREWERY, text("/brewery/brewery_name"));
        if let Some(rating) = p
            .get("rating_score")
            .and_then(Value::as_f64)
            .filter(|r| *r > 0.0)
        {
            rec.set(field::RATING, rating.to_string());
        }
        // Untappd sends `venue: []` when the checkin has no venue.
        if let Some(venue) = p.get("venue").filter(|v| v.is_object()) {
            let v = |ptr: &str| venue.pointer(ptr).and_then(json_str).unwrap_or_default();
            rec.set(field::VENUE_NAME, v("/venue_name"));
            rec.set(field::ADDRESS, v("/location/venue_address"));
            rec.set(field::LOCALITY, v("/location/venue_city"));
            rec.set(field::REGION, v("/location/venue_state"));
            rec.set(field::COUNTRY, v("/location/venue_country"));
            rec.set(field::LATITUDE, v("/location/lat"));
            rec.set(field::LONGITUDE, v("/location/lng"));
            rec.set(field::FOURSQUARE_VENUE_ID, v("/foursquare/foursquare_id"));
        }
        rec.content_note = text("/checkin_comment");
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn beer_search_parsing() {
        let body = json!({ "response": { "beers": { "count": 2, "items": [
            { "beer": { "bid": 16630, "beer_name": "Punk IPA" }, "brewery": { "brewery_name": "BrewDog" } },
            { "beer": { "beer_name": "no bid" } }
        ]}}});
        let beers = parse_beer_search(&body);
        assert_eq!(
            beers,
            vec![Beer {
                bid: "16630".into(),
                name: "Punk IPA".into(),
                brewery: Some("BrewDog".into())
            }]
        );
        assert!(parse_beer_search(&json!({ "response": {} })).is_empty());
    }

    #[test]
    fn checkin_page_parsing_and_mapping() {
        let body = json!({ "response": {
            "pagination": { "max_id": 900 },
            "checkins": { "count": 2, "items": [
                {
                    "checkin_id": 1001,
                    "created_at": "Wed, 01 May 2024 12:00:00 +0000",
                    "checkin_comment": "crisp",
                    "rating_score": 3.75,
                    "user": { "user_name": "hopper" },
                    "beer": { "bid": 16630, "beer_name": "Punk IPA", "beer_style": "IPA - American" },
                    "brewery": { "brewery_name": "BrewDog" },
                    "venue": {
                        "venue_name": "The Harp",
                        "location": { "venue_city": "London", "lat": 51.5098, "lng": -0.1246 },
                        "foursquare": { "foursquare_id": "4ac518cef964a520" }
                    }
                },
                {
                    "checkin_id": 1000,
                    "created_at": "Tue, 30 Apr 2024 20:00:00 +0000",
                    "beer": { "bid": 1 },
                    "venue": []
                }
            ]}
        }});
        let (items, next) = parse_checkins(&body);
        assert_eq!(next.as_deref(), Some("900"));
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].url.as_deref(),
            Some("https://untappd.com/user/hopper/checkin/1001")
        );

        let adapter = UntappdAdapter::new(crate::adapters::testing::test_ctx());
        let rec = adapter.to_record(&items[0]).unwrap();
        assert_eq!(rec.field(field::BEER_NAME), Some("Punk IPA"));
        assert_eq!(rec.field(field::UNTAPPD_BEER_ID), Some("16630"));
        assert_eq!(rec.field(field::VENUE_NAME), Some("The Harp"));
        assert_eq!(rec.field(field::FOURSQUARE_VENUE_ID), Some("4ac518cef964a520"));
        assert_eq!(rec.field(field::RATING), Some("3.75"));
        assert_eq!(rec.content_note, "crisp");
        assert_eq!(rec.occurred_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");

        // Missing beer name.
        assert!(matches!(
            adapter.to_record(&items[1]),
            Err(SyncError::Malformed(_))
        ));
    }

    #[test]
    fn checkin_form_rounds_rating_to_quarters() {
        let adapter_record = |rating: &str| {
            let mut fields = Fields::new();
            fields.insert(field::RATING.into(), rating.into());
            ReactionRecord {
                id: "r".into(),
                kind: Kind::Checkin,
                fields,
                content_note: String::new(),
                status: crate::model::Status::Published,
                created_at: Utc::now(),
                published_at: None,
                imported_from: None,
                external_ids: Default::default(),
                syndication_urls: Default::default(),
            }
        };
        let form = build_checkin_form(&adapter_record("3.8"), "42");
        assert!(form.contains(&("bid", "42".to_string())));
        assert!(form.contains(&("rating", "3.75".to_string())));

        let form = build_checkin_form(&adapter_record("9"), "42");
        assert!(form.iter().all(|(k, _)| *k != "rating"));
    }

    #[test]
    fn auth_url_uses_redirect_url_param() {
        let url = build_auth_url(&parse_base(AUTH_BASE), "cid", "https://b/cb", "s");
        assert!(url.starts_with("https://untappd.com/oauth/authenticate/?"));
        assert!(url.contains("redirect_url=https%3A%2F%2Fb%2Fcb"));
    }
}
