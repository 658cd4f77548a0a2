//! Stock image search passthrough

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::remote::retry::RemoteError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHit {
    #[serde(rename(deserialize = "webformatURL"))]
    pub preview_url: String,
    #[serde(rename(deserialize = "largeImageURL"))]
    pub full_url: String,
}

#[derive(Debug, Deserialize)]
struct ImageSearchResponse {
    hits: Vec<ImageHit>,
}

#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<ImageHit>, RemoteError>;
}

pub struct HttpImageSearch {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpImageSearch {
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
}

#[async_trait]
impl ImageSearch for HttpImageSearch {
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<ImageHit>, RemoteError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", query),
                ("image_type", "photo"),
                ("per_page", &limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RemoteError::RateLimited);
        }
        if !status.is_success() {
            return Err(RemoteError::Fatal(format!("HTTP {status} from image search")));
        }

        let parsed: ImageSearchResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("bad image search payload: {e}")))?;
        Ok(parsed.hits)
    }
}
