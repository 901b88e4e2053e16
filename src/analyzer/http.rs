// src/analyzer/http.rs
// Messages-API analyzer backend; both tiers are instances of this client
// pointed at different models.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{AnalyzerBackend, BackendReply};
use crate::error::{Result, SleuthError};

pub struct HttpAnalyzer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HttpAnalyzer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
        })
    }
}

#[async_trait]
impl AnalyzerBackend for HttpAnalyzer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: String) -> Result<BackendReply> {
        let start = Instant::now();

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            // Low temperature keeps the JSON answers consistent run to run
            "temperature": 0.1,
            "messages": [{"role": "user", "content": prompt}],
        });

        debug!(model = %self.model, "analyzer request");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| SleuthError::BackendUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SleuthError::BackendUnavailable(format!(
                "{status}: {error_text}"
            )));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| SleuthError::MalformedResponse(e.to_string()))?;
        let latency_ms = start.elapsed().as_millis() as i64;

        let text = raw["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                SleuthError::MalformedResponse("no content block in backend reply".to_string())
            })?
            .to_string();

        let usage = raw.get("usage");
        let input_tokens = usage.and_then(|u| u["input_tokens"].as_i64());
        let output_tokens = usage.and_then(|u| u["output_tokens"].as_i64());

        Ok(BackendReply {
            text,
            input_tokens,
            output_tokens,
            latency_ms,
        })
    }
}
