//! LLM backend abstraction and implementations.
//!
//! Defines the [`ExtractionClient`] trait and two concrete backends:
//! - **[`GeminiClient`]** calls `models/<model>:generateContent`.
//! - **[`OpenAiClient`]** calls `chat/completions`.
//!
//! Both use the blocking `reqwest` client because extraction runs on a
//! dedicated worker pool. They must therefore be created, used, and dropped
//! outside of an async context (the pipeline does this inside
//! `spawn_blocking`).
//!
//! # Provider Selection
//!
//! Use [`create_client`] to instantiate the backend named by
//! `llm.provider`. The API key is read from the environment variable named
//! by the provider's `api_key_env` setting; a missing key is an error.
//!
//! # Errors
//!
//! `generate` fails on transport errors, non-success HTTP status, and
//! responses with no usable text. Retrying is left to recovery.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{LlmConfig, Provider};

const SYSTEM_PROMPT: &str = "You are a precise extraction engine that returns valid JSON only.";
const ERROR_BODY_CHARS: usize = 300;

/// A text generation backend.
pub trait ExtractionClient: Send + Sync {
    /// Provider name recorded alongside results (e.g. `"gemini"`).
    fn provider(&self) -> &str;
    /// Model identifier (e.g. `"gemini-2.5-flash"`).
    fn model(&self) -> &str;
    /// Generate a completion for `prompt`.
    fn generate(&self, prompt: &str) -> Result<String>;
}

fn build_http(timeout_secs: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .with_context(|| "Failed to build LLM HTTP client")
}

fn send_json(
    name: &str,
    request: reqwest::blocking::RequestBuilder,
    body: &Value,
) -> Result<Value> {
    let response = request
        .json(body)
        .send()
        .map_err(|e| anyhow!("{} request failed: {}", name, e.without_url()))?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().unwrap_or_default();
        bail!(
            "{} API error {}: {}",
            name,
            status,
            text.chars().take(ERROR_BODY_CHARS).collect::<String>()
        );
    }
    response
        .json::<Value>()
        .map_err(|e| anyhow!("{} response was not valid JSON: {}", name, e.without_url()))
}

pub struct GeminiClient {
    http: reqwest::blocking::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
}

impl GeminiClient {
    /// Create a client from configuration, reading the key from the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let key_config = LlmConfig {
            provider: Provider::Gemini,
            ..config.clone()
        };
        let api_key = key_config.api_key()?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(config.timeout_secs)?,
            api_key: api_key.into(),
            model: config.gemini.model.clone(),
            base_url: config.gemini.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        })
    }
}

impl ExtractionClient for GeminiClient {
    fn provider(&self) -> &str {
        Provider::Gemini.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": self.temperature},
        });
        let request = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())]);
        let payload = send_json("Gemini", request, &body)?;
        parse_gemini_response(&payload)
    }
}

/// Concatenate the text parts of the first candidate.
pub fn parse_gemini_response(json: &Value) -> Result<String> {
    let candidate = json
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow!("Gemini response contained no candidates"))?;
    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| anyhow!("Gemini response contained no content parts"))?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    let text = text.trim();
    if text.is_empty() {
        bail!("Gemini response text was empty");
    }
    Ok(text.to_string())
}

pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f64,
}

impl OpenAiClient {
    /// Create a client from configuration, reading the key from the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let key_config = LlmConfig {
            provider: Provider::OpenAi,
            ..config.clone()
        };
        let api_key = key_config.api_key()?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_http(config.timeout_secs)?,
            api_key: api_key.into(),
            model: config.openai.model.clone(),
            base_url: config.openai.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        })
    }
}

impl ExtractionClient for OpenAiClient {
    fn provider(&self) -> &str {
        Provider::OpenAi.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
        });
        let request = self.http.post(&url).bearer_auth(&self.api_key);
        let payload = send_json("OpenAI", request, &body)?;
        parse_openai_response(&payload)
    }
}

/// Message content of the first choice.
pub fn parse_openai_response(json: &Value) -> Result<String> {
    let choice = json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow!("OpenAI response contained no choices"))?;
    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if content.is_empty() {
        bail!("OpenAI response content was empty");
    }
    Ok(content.to_string())
}

/// Create the backend selected by `config.provider`.
///
/// | `llm.provider` | Client |
/// |----------------|--------|
/// | `gemini` | [`GeminiClient`] |
/// | `openai` | [`OpenAiClient`] |
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn ExtractionClient>> {
    let client: Arc<dyn ExtractionClient> = match config.provider {
        Provider::Gemini => Arc::new(GeminiClient::new(config)?),
        Provider::OpenAi => Arc::new(OpenAiClient::new(config)?),
    };
    Ok(client)
}
