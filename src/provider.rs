//! Generation provider adapters.
//!
//! Two image-provider shapes hide behind one trait: a synchronous endpoint
//! whose response carries the asset URL directly, and a submit/poll job API
//! with a bounded poll loop. Retry around `generate` is the orchestrator's
//! job; the adapters only classify failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{GenerationConfig, ImageProviderConfig, ImageProviderKind, TextProviderConfig};
use crate::error::GenerationError;

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate one image for `prompt`, optionally anchored to a reference
    /// image, and return the remote asset URL.
    async fn generate(
        &self,
        prompt: &str,
        reference_image_url: Option<&str>,
    ) -> Result<String, GenerationError>;
}

#[async_trait]
pub trait TextProvider: Send + Sync {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, GenerationError>;
}

pub fn image_provider_from_config(
    config: &ImageProviderConfig,
    generation: &GenerationConfig,
) -> anyhow::Result<Arc<dyn ImageProvider>> {
    let api_key = match &config.api_key_env {
        Some(var) => Some(
            std::env::var(var).map_err(|_| anyhow::anyhow!("{var} is not set"))?,
        ),
        None => None,
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .context("build http client")?;

    let provider: Arc<dyn ImageProvider> = match config.kind {
        ImageProviderKind::SyncUrl => Arc::new(SyncUrlProvider {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        }),
        ImageProviderKind::Poll => Arc::new(PollingProvider {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: generation.poll_interval(),
            max_polls: generation.max_polls,
        }),
    };
    Ok(provider)
}

pub fn text_provider_from_config(
    config: &TextProviderConfig,
) -> anyhow::Result<Arc<dyn TextProvider>> {
    let api_key = std::env::var(&config.api_key_env)
        .map_err(|_| anyhow::anyhow!("{} is not set", config.api_key_env))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("build http client")?;

    Ok(Arc::new(OpenAiTextProvider {
        client,
        endpoint: responses_endpoint(&config.base_url),
        api_key,
        model: config.model.clone(),
        temperature: config.temperature,
    }))
}

/// Single request/response provider: the asset URL is in the response body.
pub struct SyncUrlProvider {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncGenerateResponse {
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ImageProvider for SyncUrlProvider {
    async fn generate(
        &self,
        prompt: &str,
        reference_image_url: Option<&str>,
    ) -> Result<String, GenerationError> {
        let url = format!("{}/generate", self.base_url);
        let body = serde_json::json!({
            "prompt": prompt,
            "reference_image_url": reference_image_url,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| GenerationError::Provider(format!("POST {url}: {err}")))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|err| GenerationError::Provider(format!("read response body: {err}")))?;
        if !status.is_success() {
            let message = parse_error_field(&raw).unwrap_or(raw);
            return Err(GenerationError::Provider(format!(
                "generate failed ({status}): {message}"
            )));
        }

        let parsed: SyncGenerateResponse = serde_json::from_str(&raw)
            .map_err(|err| GenerationError::Provider(format!("parse response: {err}")))?;
        if let Some(error) = parsed.error {
            return Err(GenerationError::Provider(format!(
                "provider reported failure: {error}"
            )));
        }
        parsed
            .image_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| GenerationError::Provider("response has no image_url".into()))
    }
}

/// Submit-then-poll provider. `submit` returns a job id which is polled on a
/// fixed interval up to `max_polls` iterations; exceeding the ceiling is a
/// timeout, handled by callers exactly like a provider error.
pub struct PollingProvider {
    pub client: reqwest::Client,
    pub base_url: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PollResponse {
    pub status: JobState,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl PollingProvider {
    async fn submit(&self, prompt: &str, reference_image_url: Option<&str>) -> Result<String, GenerationError> {
        let url = format!("{}/jobs", self.base_url);
        let body = serde_json::json!({
            "prompt": prompt,
            "reference_image_url": reference_image_url,
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| GenerationError::Provider(format!("POST {url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = parse_error_field(&raw).unwrap_or(raw);
            return Err(GenerationError::Provider(format!(
                "submit failed ({status}): {message}"
            )));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::Provider(format!("parse submit response: {err}")))?;
        Ok(parsed.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollResponse, GenerationError> {
        let url = format!("{}/jobs/{job_id}", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| GenerationError::Provider(format!("GET {url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Provider(format!(
                "poll failed ({status}) for job {job_id}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| GenerationError::Provider(format!("parse poll response: {err}")))
    }
}

#[async_trait]
impl ImageProvider for PollingProvider {
    async fn generate(
        &self,
        prompt: &str,
        reference_image_url: Option<&str>,
    ) -> Result<String, GenerationError> {
        let job_id = self.submit(prompt, reference_image_url).await?;
        tracing::debug!(job_id, "submitted generation job");

        for _poll in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let poll = self.poll(&job_id).await?;
            match poll.status {
                JobState::Queued | JobState::Processing => continue,
                JobState::Completed => {
                    return poll
                        .image_url
                        .filter(|url| !url.trim().is_empty())
                        .ok_or_else(|| {
                            GenerationError::Provider(format!(
                                "job {job_id} completed without an image_url"
                            ))
                        });
                }
                JobState::Failed => {
                    let message = poll.error.unwrap_or_else(|| "unspecified".to_string());
                    return Err(GenerationError::Provider(format!(
                        "job {job_id} failed: {message}"
                    )));
                }
            }
        }

        Err(GenerationError::Timeout(format!(
            "job {job_id} did not complete within {} polls",
            self.max_polls
        )))
    }
}

fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

/// Text generation over an OpenAI-style responses endpoint.
pub struct OpenAiTextProvider {
    pub client: reqwest::Client,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
}

#[async_trait]
impl TextProvider for OpenAiTextProvider {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "instructions": instructions,
            "input": input,
            "temperature": self.temperature,
            "text": { "format": { "type": "text" } },
            "store": false,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GenerationError::Provider(format!("POST {}: {err}", self.endpoint)))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|err| GenerationError::Provider(format!("read response body: {err}")))?;
        if !status.is_success() {
            let message = parse_api_error_message(&raw).unwrap_or(raw);
            return Err(GenerationError::Provider(format!(
                "text provider error ({status}): {message}"
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| GenerationError::Provider(format!("parse response: {err}")))?;
        extract_output_text(&value).map_err(|err| GenerationError::Provider(format!("{err:#}")))
    }
}

fn parse_error_field(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    Some(value.get("error")?.as_str()?.to_owned())
}

fn parse_api_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        let content = match item.get("content").and_then(|v| v.as_array()) {
            Some(content) => content,
            None => continue,
        };
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) != Some("output_text") {
                continue;
            }
            let Some(part_text) = part.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            text.push_str(part_text);
        }
    }

    if text.trim().is_empty() {
        anyhow::bail!("text provider output is empty");
    }
    Ok(text)
}
