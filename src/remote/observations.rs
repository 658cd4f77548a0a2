//! Species observation provider client
//!
//! Read-only feeds consumed by the catalog synchronizer: the region species
//! list, the full taxonomy, and recent observations. All are plain GETs with
//! an API-key header. The trait seam lets reconciliation tests script the
//! feeds without a network.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::remote::retry::RemoteError;

/// Taxonomy entry as the provider ships it
#[derive(Debug, Clone, Deserialize)]
pub struct TaxonEntry {
    #[serde(rename = "speciesCode")]
    pub species_code: String,
    #[serde(rename = "comName")]
    pub common_name: String,
    #[serde(rename = "sciName")]
    pub scientific_name: String,
    #[serde(rename = "familyComName", default)]
    pub family: String,
}

/// One recent observation from the feed
#[derive(Debug, Clone, Deserialize)]
pub struct Observation {
    #[serde(rename = "speciesCode")]
    pub species_code: String,
    /// Provider-local timestamp, `YYYY-MM-DD HH:MM`
    #[serde(rename = "obsDt")]
    pub observed_at: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    #[serde(rename = "locName")]
    pub locality: Option<String>,
}

impl Observation {
    /// Parse the provider timestamp; feeds occasionally drop the time part
    pub fn observed_at_utc(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.observed_at, "%Y-%m-%d %H:%M")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Only observations with real coordinates can drive a last-seen record
    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }
}

#[async_trait]
pub trait ObservationProvider: Send + Sync {
    /// Species codes currently present in the region
    async fn region_species(&self, region: &str) -> Result<Vec<String>, RemoteError>;

    /// Full provider taxonomy
    async fn taxonomy(&self) -> Result<Vec<TaxonEntry>, RemoteError>;

    /// Recent-observation feed for the region
    async fn recent_observations(&self, region: &str) -> Result<Vec<Observation>, RemoteError>;
}

/// HTTP client for the observation provider
pub struct HttpObservationProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpObservationProvider {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Fatal(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RemoteError::RateLimited);
        }
        if !status.is_success() {
            return Err(RemoteError::Fatal(format!("HTTP {status} from {url}")));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("bad feed payload from {url}: {e}")))
    }
}

#[async_trait]
impl ObservationProvider for HttpObservationProvider {
    async fn region_species(&self, region: &str) -> Result<Vec<String>, RemoteError> {
        self.get_json(&format!("/product/spplist/{region}")).await
    }

    async fn taxonomy(&self) -> Result<Vec<TaxonEntry>, RemoteError> {
        self.get_json("/ref/taxonomy?fmt=json").await
    }

    async fn recent_observations(&self, region: &str) -> Result<Vec<Observation>, RemoteError> {
        self.get_json(&format!("/data/obs/{region}/recent")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_timestamp_parses() {
        let obs = Observation {
            species_code: "norcar".into(),
            observed_at: "2026-08-01 07:45".into(),
            lat: Some(33.749),
            lng: Some(-84.388),
            locality: Some("Piedmont Park".into()),
        };
        let parsed = obs.observed_at_utc().unwrap();
        assert_eq!(parsed.format("%Y-%m-%d %H:%M").to_string(), "2026-08-01 07:45");
        assert!(obs.has_coordinates());
    }

    #[test]
    fn test_malformed_timestamp_is_none() {
        let obs = Observation {
            species_code: "norcar".into(),
            observed_at: "yesterday".into(),
            lat: None,
            lng: None,
            locality: None,
        };
        assert!(obs.observed_at_utc().is_none());
        assert!(!obs.has_coordinates());
    }
}
