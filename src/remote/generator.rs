//! Generative content service client
//!
//! Chat-style completion endpoint with bearer auth. Two shapes of call:
//! structured JSON generation for fact sheets, and vision identification
//! with an inlined image. Both go through the retrying caller at the call
//! sites, never here; this client classifies a single attempt.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use crate::remote::retry::RemoteError;

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Ask for a JSON object following the prompt's field schema
    async fn complete_json(&self, prompt: &str, max_tokens: u32)
        -> Result<JsonValue, RemoteError>;

    /// Vision call: prompt plus an inlined base64 image, free-text reply
    async fn identify_image(&self, prompt: &str, image_b64: &str)
        -> Result<String, RemoteError>;
}

/// HTTP client for the generative content service
pub struct HttpContentGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpContentGenerator {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Fatal(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn post_completion(&self, body: JsonValue) -> Result<String, RemoteError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RemoteError::RateLimited);
        }
        if !status.is_success() {
            return Err(RemoteError::Fatal(format!("HTTP {status} from completion endpoint")));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Fatal(format!("bad completion payload: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RemoteError::Fatal("completion returned no choices".into()))
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn complete_json(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<JsonValue, RemoteError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "response_format": { "type": "json_object" },
            "temperature": 0.7,
            "max_tokens": max_tokens,
        });

        let content = self.post_completion(body).await?;
        serde_json::from_str(&content)
            .map_err(|e| RemoteError::Fatal(format!("completion was not valid JSON: {e}")))
    }

    async fn identify_image(
        &self,
        prompt: &str,
        image_b64: &str,
    ) -> Result<String, RemoteError> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{image_b64}") }
                    }
                ]
            }],
            "max_tokens": 300,
        });

        self.post_completion(body).await
    }
}
