//! Domain types shared by the stores, adapters and sync engines.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind-specific attributes of a reaction, keyed by the names in [`field`].
pub type Fields = BTreeMap<String, String>;

/// Well-known field names. Adapters and policies agree on these.
pub mod field {
    // checkin
    pub const VENUE_NAME: &str = "venue_name";
    pub const ADDRESS: &str = "address";
    pub const LOCALITY: &str = "locality";
    pub const REGION: &str = "region";
    pub const COUNTRY: &str = "country";
    pub const LATITUDE: &str = "latitude";
    pub const LONGITUDE: &str = "longitude";
    pub const FOURSQUARE_VENUE_ID: &str = "foursquare_venue_id";
    pub const BEER_NAME: &str = "beer_name";
    pub const BREWERY: &str = "brewery";
    pub const BEER_STYLE: &str = "beer_style";
    pub const UNTAPPD_BEER_ID: &str = "untappd_beer_id";
    pub const RATING: &str = "rating";

    // listen
    pub const TRACK: &str = "track";
    pub const ARTIST: &str = "artist";
    pub const ALBUM: &str = "album";
    pub const DURATION: &str = "duration";
    pub const TRACK_MBID: &str = "track_mbid";
    pub const ARTIST_MBID: &str = "artist_mbid";
    pub const URL: &str = "url";

    // watch
    pub const TITLE: &str = "title";
    pub const YEAR: &str = "year";
    pub const MEDIA_TYPE: &str = "media_type";
    pub const SEASON: &str = "season";
    pub const EPISODE: &str = "episode";
    pub const EPISODE_TITLE: &str = "episode_title";
    pub const TMDB_ID: &str = "tmdb_id";
    pub const IMDB_ID: &str = "imdb_id";
    pub const TRAKT_ID: &str = "trakt_id";

    /// Per-record opt-out prefix: `sync_to_<service>` = "false" disables POSSE for that service.
    pub const SYNC_TO_PREFIX: &str = "sync_to_";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Listen,
    Watch,
    Read,
    Checkin,
    Like,
    Reply,
    Repost,
    Bookmark,
    Rsvp,
    Note,
    Article,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Listen => "listen",
            Kind::Watch => "watch",
            Kind::Read => "read",
            Kind::Checkin => "checkin",
            Kind::Like => "like",
            Kind::Reply => "reply",
            Kind::Repost => "repost",
            Kind::Bookmark => "bookmark",
            Kind::Rsvp => "rsvp",
            Kind::Note => "note",
            Kind::Article => "article",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        Some(match s {
            "listen" => Kind::Listen,
            "watch" => Kind::Watch,
            "read" => Kind::Read,
            "checkin" => Kind::Checkin,
            "like" => Kind::Like,
            "reply" => Kind::Reply,
            "repost" => Kind::Repost,
            "bookmark" => Kind::Bookmark,
            "rsvp" => Kind::Rsvp,
            "note" => Kind::Note,
            "article" => Kind::Article,
            _ => return None,
        })
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Draft,
    Pending,
    Private,
    Published,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::Pending => "pending",
            Status::Private => "private",
            Status::Published => "published",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Status::Draft),
            "pending" => Some(Status::Pending),
            "private" => Some(Status::Private),
            "published" => Some(Status::Published),
            _ => None,
        }
    }
}

/// External systems this service can sync with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Foursquare,
    Untappd,
    Lastfm,
    Trakt,
    Owntracks,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::Foursquare,
        Service::Untappd,
        Service::Lastfm,
        Service::Trakt,
        Service::Owntracks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Foursquare => "foursquare",
            Service::Untappd => "untappd",
            Service::Lastfm => "lastfm",
            Service::Trakt => "trakt",
            Service::Owntracks => "owntracks",
        }
    }

    pub fn parse_service(s: &str) -> Option<Self> {
        Service::ALL.into_iter().find(|svc| svc.as_str() == s)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single user activity entry as held by the content store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionRecord {
    pub id: String,
    pub kind: Kind,
    pub fields: Fields,
    pub content_note: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub imported_from: Option<Service>,
    pub external_ids: BTreeMap<Service, String>,
    pub syndication_urls: BTreeMap<Service, String>,
}

impl ReactionRecord {
    /// Returns the trimmed value of `key`, treating blank values as absent.
    pub fn field(&self, key: &str) -> Option<&str> {
        non_empty(&self.fields, key)
    }

    pub fn field_f64(&self, key: &str) -> Option<f64> {
        self.field(key).and_then(|v| v.parse().ok())
    }

    /// Latitude/longitude pair when both parse.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((
            self.field_f64(field::LATITUDE)?,
            self.field_f64(field::LONGITUDE)?,
        ))
    }

    /// The moment the activity happened: publish time, else creation time.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.created_at)
    }

    /// True only when the record explicitly disables syndication to `service`.
    pub fn opted_out(&self, service: Service) -> bool {
        let key = format!("{}{}", field::SYNC_TO_PREFIX, service.as_str());
        matches!(
            self.field(&key).map(str::to_ascii_lowercase).as_deref(),
            Some("false" | "0" | "no" | "off")
        )
    }

    pub fn is_syndicated_to(&self, service: Service) -> bool {
        self.external_ids
            .get(&service)
            .is_some_and(|id| !id.trim().is_empty())
    }
}

/// Input for [`crate::store::ContentStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRecord {
    pub kind: Kind,
    pub fields: Fields,
    pub content_note: String,
    pub status: Status,
    pub occurred_at: DateTime<Utc>,
    pub imported_from: Option<Service>,
    pub external_id: Option<ExternalRef>,
}

impl NewRecord {
    pub fn new(kind: Kind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            fields: Fields::new(),
            content_note: String::new(),
            status: Status::Draft,
            occurred_at,
            imported_from: None,
            external_id: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        non_empty(&self.fields, key)
    }

    /// Sets `key` when `value` is non-empty after trimming.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            self.fields.insert(key.to_string(), trimmed.to_string());
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }
}

/// An external identity attached to a record at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalRef {
    pub service: Service,
    pub id: String,
    pub url: Option<String>,
}

fn non_empty<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Credential keys understood by the adapters.
pub mod cred {
    pub const ENABLED: &str = "enabled";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const API_KEY: &str = "api_key";
    pub const SHARED_SECRET: &str = "shared_secret";
    pub const USERNAME: &str = "username";
    pub const WEBHOOK_USERNAME: &str = "webhook_username";
    pub const WEBHOOK_PASSWORD: &str = "webhook_password";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const TOKEN_EXPIRES_AT: &str = "token_expires_at";
    pub const DISPLAY_NAME: &str = "display_name";
    pub const OAUTH_STATE: &str = "oauth_state";

    /// Keys removed by a disconnect. Static configuration survives.
    pub const TOKEN_KEYS: [&str; 5] = [
        ACCESS_TOKEN,
        REFRESH_TOKEN,
        TOKEN_EXPIRES_AT,
        DISPLAY_NAME,
        OAUTH_STATE,
    ];
}

/// Per-service auth material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub values: BTreeMap<String, String>,
}

impl Credential {
    pub fn get(&self, key: &str) -> Option<&str> {
        non_empty(&self.values, key)
    }

    /// Only an explicit "0"/"false" switches a service off; tokens stored
    /// before any configuration was seeded still count.
    pub fn enabled(&self) -> bool {
        !matches!(self.get(cred::ENABLED), Some("0" | "false"))
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get(cred::ACCESS_TOKEN)
    }

    /// True when the stored access token has a known expiry that has passed.
    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        self.get(cred::TOKEN_EXPIRES_AT)
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|exp| exp <= now.timestamp())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys only; values are secrets.
        let keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        write!(f, "Credential({})", keys.join(","))
    }
}

/// A partial credential update. `None` deletes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPatch {
    pub values: BTreeMap<String, Option<String>>,
}

impl CredentialPatch {
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), Some(value.into()));
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.values.insert(key.to_string(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outcome of one import batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total: usize,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[(&str, &str)]) -> ReactionRecord {
        ReactionRecord {
            id: "r1".into(),
            kind: Kind::Checkin,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            content_note: String::new(),
            status: Status::Draft,
            created_at: Utc::now(),
            published_at: None,
            imported_from: None,
            external_ids: BTreeMap::new(),
            syndication_urls: BTreeMap::new(),
        }
    }

    #[test]
    fn opt_out_requires_explicit_false() {
        assert!(!record(&[]).opted_out(Service::Foursquare));
        assert!(!record(&[("sync_to_foursquare", "true")]).opted_out(Service::Foursquare));
        assert!(record(&[("sync_to_foursquare", "false")]).opted_out(Service::Foursquare));
        assert!(record(&[("sync_to_foursquare", "0")]).opted_out(Service::Foursquare));
        assert!(!record(&[("sync_to_foursquare", "0")]).opted_out(Service::Untappd));
    }

    #[test]
    fn blank_fields_are_absent() {
        let r = record(&[("venue_name", "   "), ("latitude", "51.5"), ("longitude", "x")]);
        assert_eq!(r.field("venue_name"), None);
        assert_eq!(r.field_f64("latitude"), Some(51.5));
        assert_eq!(r.coordinates(), None);
    }

    #[test]
    fn service_and_kind_names_roundtrip() {
        for svc in Service::ALL {
            assert_eq!(Service::parse_service(svc.as_str()), Some(svc));
        }
        assert_eq!(Kind::parse_kind("checkin"), Some(Kind::Checkin));
        assert_eq!(Status::parse_status("published"), Some(Status::Published));
        assert_eq!(Service::parse_service("myspace"), None);
    }

    #[test]
    fn credentials_are_enabled_unless_switched_off() {
        let mut c = Credential::default();
        assert!(c.enabled());
        c.values.insert(cred::ENABLED.into(), "1".into());
        assert!(c.enabled());
        c.values.insert(cred::ENABLED.into(), "0".into());
        assert!(!c.enabled());
        c.values.insert(cred::ENABLED.into(), "false".into());
        assert!(!c.enabled());
    }

    #[test]
    fn token_expiry() {
        let now = Utc::now();
        let mut c = Credential::default();
        assert!(!c.token_expired(now));
        c.values
            .insert(cred::TOKEN_EXPIRES_AT.into(), (now.timestamp() - 1).to_string());
        assert!(c.token_expired(now));
    }
}
