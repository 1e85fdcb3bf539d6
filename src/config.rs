//! Configuration loader and validator for the reaction sync service.
use crate::model::{cred, CredentialPatch, Kind, Service, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub services: BTreeMap<Service, ServiceSettings>,
    #[serde(default)]
    pub geocoder: GeocoderSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub listen_addr: String,
    /// Externally reachable base URL; OAuth redirect URIs hang off it.
    pub public_url: String,
    /// Where OAuth callbacks send the browser once they finish.
    #[serde(default = "default_admin_redirect")]
    pub admin_redirect: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// 0 disables scheduled imports.
    #[serde(default)]
    pub import_interval_seconds: u64,
    #[serde(default = "default_import_limit")]
    pub import_limit: usize,
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_seconds: i64,
    #[serde(default = "default_location_radius")]
    pub location_radius_degrees: f64,
}

fn default_admin_redirect() -> String {
    "/".into()
}
fn default_http_timeout() -> u64 {
    20
}
fn default_import_limit() -> usize {
    50
}
fn default_duplicate_window() -> i64 {
    300
}
fn default_location_radius() -> f64 {
    0.001
}

/// Direction toggles and default statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    /// POSSE: syndicate published records to the service.
    #[serde(default)]
    pub sync_to: BTreeMap<Service, bool>,
    /// PESOS: import recent activity from the service on a schedule.
    #[serde(default)]
    pub auto_import: BTreeMap<Service, bool>,
    #[serde(default)]
    pub default_status: BTreeMap<Kind, Status>,
    /// Status for checkins created from location pushes.
    #[serde(default = "default_location_status")]
    pub location_status: Status,
}

fn default_location_status() -> Status {
    Status::Private
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_to: BTreeMap::new(),
            auto_import: BTreeMap::new(),
            default_status: BTreeMap::new(),
            location_status: default_location_status(),
        }
    }
}

impl SyncSettings {
    pub fn sync_to(&self, service: Service) -> bool {
        self.sync_to.get(&service).copied().unwrap_or(false)
    }

    pub fn auto_import(&self, service: Service) -> bool {
        self.auto_import.get(&service).copied().unwrap_or(false)
    }

    pub fn default_status(&self, kind: Kind) -> Status {
        self.default_status
            .get(&kind)
            .copied()
            .unwrap_or(Status::Published)
    }
}

/// Static per-service credential material. Rotating tokens live in the
/// credential store, never here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSettings {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub webhook_username: Option<String>,
    #[serde(default)]
    pub webhook_password: Option<String>,
    /// `false` keeps the service configured but treated as disconnected.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ServiceSettings {
    /// Patch seeding the credential store; unset values leave stored ones alone.
    pub fn seed_patch(&self) -> CredentialPatch {
        [
            (cred::CLIENT_ID, &self.client_id),
            (cred::CLIENT_SECRET, &self.client_secret),
            (cred::API_KEY, &self.api_key),
            (cred::SHARED_SECRET, &self.shared_secret),
            (cred::USERNAME, &self.username),
            (cred::WEBHOOK_USERNAME, &self.webhook_username),
            (cred::WEBHOOK_PASSWORD, &self.webhook_password),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (key, v.to_string()))
        })
        .fold(CredentialPatch::default(), |patch, (key, value)| {
            patch.set(key, value)
        })
        .set(
            cred::ENABLED,
            if self.enabled.unwrap_or(true) { "1" } else { "0" },
        )
    }

    fn has(value: &Option<String>) -> bool {
        value.as_deref().is_some_and(|v| !v.trim().is_empty())
    }
}

/// Reverse geocoding (Nominatim-compatible).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeocoderSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_geocoder_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_geocoder_url() -> String {
    "https://nominatim.openstreetmap.org/".into()
}
fn default_user_agent() -> String {
    "reaction-sync/0.1".into()
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_geocoder_url(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.app
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("app.listen_addr must be host:port"))
    }

    pub fn public_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.app.public_url)
            .map_err(|_| ConfigError::Invalid("app.public_url must be an absolute URL"))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.app.http_timeout_seconds)
    }

    pub fn duplicate_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.app.duplicate_window_seconds)
    }

    pub fn service(&self, service: Service) -> ServiceSettings {
        self.services.get(&service).cloned().unwrap_or_default()
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    cfg.listen_addr()?;
    cfg.public_url()?;
    if !(1..=60).contains(&cfg.app.http_timeout_seconds) {
        return Err(ConfigError::Invalid(
            "app.http_timeout_seconds must be between 1 and 60",
        ));
    }
    if cfg.app.import_limit == 0 {
        return Err(ConfigError::Invalid("app.import_limit must be > 0"));
    }
    if cfg.app.duplicate_window_seconds <= 0 {
        return Err(ConfigError::Invalid("app.duplicate_window_seconds must be > 0"));
    }
    if !(cfg.app.location_radius_degrees > 0.0 && cfg.app.location_radius_degrees < 1.0) {
        return Err(ConfigError::Invalid(
            "app.location_radius_degrees must be in (0, 1)",
        ));
    }

    if cfg.sync.sync_to(Service::Owntracks) {
        return Err(ConfigError::Invalid(
            "sync.sync_to.owntracks is not supported; owntracks is import-only",
        ));
    }

    let wants = |svc| cfg.sync.sync_to(svc) || cfg.sync.auto_import(svc);
    let fsq = cfg.service(Service::Foursquare);
    if wants(Service::Foursquare)
        && !(ServiceSettings::has(&fsq.client_id) && ServiceSettings::has(&fsq.client_secret))
    {
        return Err(ConfigError::Invalid(
            "services.foursquare.client_id and client_secret are required",
        ));
    }
    let untappd = cfg.service(Service::Untappd);
    if wants(Service::Untappd)
        && !(ServiceSettings::has(&untappd.client_id)
            && ServiceSettings::has(&untappd.client_secret))
    {
        return Err(ConfigError::Invalid(
            "services.untappd.client_id and client_secret are required",
        ));
    }
    let lastfm = cfg.service(Service::Lastfm);
    if wants(Service::Lastfm) && !ServiceSettings::has(&lastfm.api_key) {
        return Err(ConfigError::Invalid("services.lastfm.api_key is required"));
    }
    if cfg.sync.sync_to(Service::Lastfm) && !ServiceSettings::has(&lastfm.shared_secret) {
        return Err(ConfigError::Invalid(
            "services.lastfm.shared_secret is required for scrobbling",
        ));
    }
    if cfg.sync.auto_import(Service::Lastfm) && !ServiceSettings::has(&lastfm.username) {
        return Err(ConfigError::Invalid(
            "services.lastfm.username is required for import",
        ));
    }
    let trakt = cfg.service(Service::Trakt);
    if wants(Service::Trakt)
        && !(ServiceSettings::has(&trakt.client_id) && ServiceSettings::has(&trakt.client_secret))
    {
        return Err(ConfigError::Invalid(
            "services.trakt.client_id and client_secret are required",
        ));
    }
    if let Some(owntracks) = cfg.services.get(&Service::Owntracks) {
        if !(ServiceSettings::has(&owntracks.webhook_username)
            && ServiceSettings::has(&owntracks.webhook_password))
        {
            return Err(ConfigError::Invalid(
                "services.owntracks.webhook_username and webhook_password are required",
            ));
        }
    }

    if cfg.geocoder.enabled && Url::parse(&cfg.geocoder.base_url).is_err() {
        return Err(ConfigError::Invalid("geocoder.base_url must be an absolute URL"));
    }

    Ok(())
}

/// Returns an example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "127.0.0.1:8787"
  public_url: "https://blog.example.com/sync/"
  admin_redirect: "https://blog.example.com/admin/sync"
  http_timeout_seconds: 20
  import_interval_seconds: 900
  import_limit: 50
  duplicate_window_seconds: 300
  location_radius_degrees: 0.001

sync:
  sync_to:
    foursquare: true
    untappd: false
    lastfm: true
    trakt: true
  auto_import:
    foursquare: true
    lastfm: true
    trakt: false
  default_status:
    checkin: published
    listen: private
    watch: published
  location_status: private

services:
  foursquare:
    client_id: "FOURSQUARE_CLIENT_ID"
    client_secret: "FOURSQUARE_CLIENT_SECRET"
  untappd:
    client_id: "UNTAPPD_CLIENT_ID"
    client_secret: "UNTAPPD_CLIENT_SECRET"
  lastfm:
    api_key: "LASTFM_API_KEY"
    shared_secret: "LASTFM_SHARED_SECRET"
    username: "rj"
  trakt:
    client_id: "TRAKT_CLIENT_ID"
    client_secret: "TRAKT_CLIENT_SECRET"
  owntracks:
    webhook_username: "phone"
    webhook_password: "s3cret"

geocoder:
  enabled: true
  base_url: "https://nominatim.openstreetmap.org/"
  user_agent: "reaction-sync/0.1 (admin@example.com)"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    fn invalid_msg(cfg: &Config) -> &'static str {
        match validate(cfg).unwrap_err() {
            ConfigError::Invalid(msg) => msg,
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert!(cfg.sync.sync_to(Service::Foursquare));
        assert!(!cfg.sync.sync_to(Service::Untappd));
        assert!(!cfg.sync.auto_import(Service::Untappd));
        assert_eq!(cfg.sync.default_status(Kind::Listen), Status::Private);
        assert_eq!(cfg.sync.default_status(Kind::Read), Status::Published);
        assert_eq!(cfg.duplicate_window(), chrono::Duration::minutes(5));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "app:\n  data_dir: ./d\n  listen_addr: 0.0.0.0:80\n  public_url: http://localhost/\n",
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.http_timeout_seconds, 20);
        assert_eq!(cfg.app.import_interval_seconds, 0);
        assert_eq!(cfg.sync.location_status, Status::Private);
        assert!(!cfg.geocoder.enabled);
    }

    #[test]
    fn default_sync_settings_keep_locations_private() {
        let sync = SyncSettings::default();
        assert_eq!(sync.location_status, Status::Private);
        assert!(!sync.sync_to(Service::Trakt));
        assert_eq!(sync.default_status(Kind::Checkin), Status::Published);
    }

    #[test]
    fn invalid_app_settings() {
        let mut cfg = example_cfg();
        cfg.app.listen_addr = "nope".into();
        assert!(invalid_msg(&cfg).contains("listen_addr"));

        let mut cfg = example_cfg();
        cfg.app.public_url = "/relative".into();
        assert!(invalid_msg(&cfg).contains("public_url"));

        let mut cfg = example_cfg();
        cfg.app.http_timeout_seconds = 0;
        assert!(invalid_msg(&cfg).contains("http_timeout_seconds"));

        let mut cfg = example_cfg();
        cfg.app.location_radius_degrees = 0.0;
        assert!(invalid_msg(&cfg).contains("location_radius_degrees"));
    }

    #[test]
    fn owntracks_cannot_be_a_posse_target() {
        let mut cfg = example_cfg();
        cfg.sync.sync_to.insert(Service::Owntracks, true);
        assert!(invalid_msg(&cfg).contains("owntracks"));
    }

    #[test]
    fn enabled_services_need_credentials() {
        let mut cfg = example_cfg();
        cfg.services.remove(&Service::Trakt);
        assert!(invalid_msg(&cfg).contains("trakt"));

        let mut cfg = example_cfg();
        cfg.services.get_mut(&Service::Lastfm).unwrap().shared_secret = None;
        assert!(invalid_msg(&cfg).contains("shared_secret"));

        let mut cfg = example_cfg();
        cfg.services.get_mut(&Service::Owntracks).unwrap().webhook_password = Some(" ".into());
        assert!(invalid_msg(&cfg).contains("webhook_password"));
    }

    #[test]
    fn seed_patch_skips_blank_values() {
        let cfg = example_cfg();
        let patch = cfg.service(Service::Lastfm).seed_patch();
        assert_eq!(
            patch.values.get(cred::API_KEY),
            Some(&Some("LASTFM_API_KEY".to_string()))
        );
        assert!(!patch.values.contains_key(cred::CLIENT_ID));
        assert!(!patch.values.contains_key(cred::ACCESS_TOKEN));
    }

    #[test]
    fn enabled_flag_is_seeded() {
        let on: ServiceSettings = serde_yaml::from_str("api_key: k\n").unwrap();
        assert_eq!(on.seed_patch().values.get(cred::ENABLED), Some(&Some("1".to_string())));
        let off: ServiceSettings = serde_yaml::from_str("api_key: k\nenabled: false\n").unwrap();
        assert_eq!(off.seed_patch().values.get(cred::ENABLED), Some(&Some("0".to_string())));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(
            cfg.service(Service::Lastfm).username.as_deref(),
            Some("rj")
        );
    }
}
