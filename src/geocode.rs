//! Reverse geocoding against a Nominatim-compatible endpoint.
use crate::config::GeocoderSettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::instrument;

/// Address components for a coordinate. Every part is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Place {
    pub name: Option<String>,
    pub address: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when nothing is known about the spot.
    async fn reverse(&self, lat: f64, lon: f64) -> Result<Option<Place>>;
}

#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    http: Client,
    base: Url,
}

impl NominatimGeocoder {
    pub fn new(settings: &GeocoderSettings, timeout: Duration) -> Result<Self> {
        let base = Url::parse(&settings.base_url).context("invalid geocoder base_url")?;
        let http = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(timeout)
            .build()
            .context("failed to build geocoder client")?;
        Ok(Self { http, base })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    #[instrument(skip(self))]
    async fn reverse(&self, lat: f64, lon: f64) -> Result<Option<Place>> {
        let mut url = self.base.join("reverse").context("invalid reverse endpoint")?;
        url.query_pairs_mut()
            .append_pair("format", "jsonv2")
            .append_pair("lat", &lat.to_string())
            .append_pair("lon", &lon.to_string())
            .append_pair("zoom", "18")
            .append_pair("addressdetails", "1");
        let res = self.http.get(url).send().await?.error_for_status()?;
        let body: Value = res.json().await?;
        Ok(parse_reverse(&body))
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Maps a `reverse?format=jsonv2` body. Nominatim answers misses with `{"error": ..}`.
pub fn parse_reverse(body: &Value) -> Option<Place> {
    if body.get("error").is_some() {
        return None;
    }
    let addr = body.get("address");
    let part = |key: &str| text(addr.and_then(|a| a.get(key)));
    let address = match (part("house_number"), part("road")) {
        (Some(n), Some(road)) => Some(format!("{n} {road}")),
        (None, road) => road,
        (Some(_), None) => None,
    };
    let locality = ["city", "town", "village", "hamlet", "suburb"]
        .iter()
        .find_map(|k| part(k));
    let place = Place {
        name: text(body.get("name")),
        address,
        locality,
        region: part("state").or_else(|| part("county")),
        country: part("country"),
    };
    (place != Place::default()).then_some(place)
}
