use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vlm::{ImageSource, PromptVersion, VlmError, VlmGateway, VlmOutput, SAMPLING};

/// Ollama-compatible `/api/generate` client for a vision model.
#[derive(Clone)]
pub struct OllamaGateway {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    images: Arc<dyn ImageSource>,
}

impl OllamaGateway {
    pub fn new(
        base_url: &str,
        model: String,
        timeout: Duration,
        images: Arc<dyn ImageSource>,
    ) -> Result<Self, VlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VlmError::Unavailable(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
            images,
        })
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    seed: i64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

#[async_trait]
impl VlmGateway for OllamaGateway {
    async fn extract(
        &self,
        image_ref: &str,
        prompt_version: PromptVersion,
    ) -> Result<VlmOutput, VlmError> {
        let image = self.images.load(image_ref).await?;

        let body = GenerateRequest {
            model: &self.model,
            prompt: prompt_version.text(),
            images: vec![STANDARD.encode(&image)],
            stream: false,
            options: GenerateOptions {
                temperature: SAMPLING.temperature,
                seed: SAMPLING.seed,
                num_predict: SAMPLING.num_predict,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_connect() {
                VlmError::Unavailable(format!("cannot connect to {}", self.base_url))
            } else if e.is_timeout() {
                VlmError::Unavailable(format!(
                    "request timed out after {}s",
                    self.timeout.as_secs()
                ))
            } else {
                VlmError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OllamaErrorBody>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(VlmError::Model {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| VlmError::Model {
            status: status.as_u16(),
            message: format!("unreadable response body: {e}"),
        })?;

        debug!(
            model = %self.model,
            prompt_version = %prompt_version,
            eval_count = ?parsed.eval_count,
            chars = parsed.response.len(),
            "VLM call succeeded"
        );

        Ok(VlmOutput {
            text: parsed.response,
            model: self.model.clone(),
            prompt_version,
            eval_count: parsed.eval_count,
        })
    }
}
