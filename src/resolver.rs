//! DOI metadata resolution against a Crossref-style registry.
//!
//! Every distinct non-empty DOI is resolved once with
//! `GET <base_url>/<url-encoded DOI>`; records sharing a DOI share the
//! result, and records without one are never attempted.
//!
//! # Retry Strategy
//!
//! - HTTP 200 → resolved; the body's `message` field (or the whole body) is
//!   the metadata payload
//! - HTTP 400 / 404 → fail immediately
//! - Any other status, timeouts, and transport errors → retry
//! - Backoff between attempts: `base`, `2 × base`, `4 × base`, ... (no sleep
//!   after the final attempt)
//!
//! At most `registry.concurrency` requests are in flight. The permit is
//! held for the request only, never across a backoff sleep.

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::fanout;
use crate::models::{DoiFailure, Record, Resolution, ResolutionResult};
use crate::persist;
use crate::progress::{ProgressEvent, ProgressReporter, Stage};

const ERROR_BODY_CHARS: usize = 300;

/// Outcome of a single request.
enum Attempt {
    Resolved(Value),
    Terminal { status: u16, error: String },
    Retryable { status: Option<u16>, error: String },
}

pub struct DoiResolver {
    client: reqwest::Client,
    base_url: Url,
    config: RegistryConfig,
}

impl DoiResolver {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("Invalid registry.base_url: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("registry.base_url cannot be used as a base: {}", base_url);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .with_context(|| "Failed to build registry HTTP client")?;
        Ok(Self {
            client,
            base_url,
            config: config.clone(),
        })
    }

    /// Registry URL for `key`, with the key encoded as a single path segment.
    pub fn key_url(&self, key: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("registry.base_url cannot be used as a base"))?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.config.retry_base_delay_secs * factor)
    }

    async fn fetch_once(&self, key: &str) -> Attempt {
        let url = match self.key_url(key) {
            Ok(url) => url,
            Err(e) => {
                return Attempt::Retryable {
                    status: None,
                    error: format!("UnexpectedError: {}", e),
                }
            }
        };

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return self.transport_failure(None, e),
        };

        let status = response.status();
        if status == StatusCode::OK {
            return match response.json::<Value>().await {
                Ok(body) => Attempt::Resolved(metadata_payload(body)),
                Err(e) => self.transport_failure(Some(status.as_u16()), e),
            };
        }

        let body = response.text().await.unwrap_or_default();
        let error = format!(
            "HTTP {}: {}",
            status.as_u16(),
            body.chars().take(ERROR_BODY_CHARS).collect::<String>()
        );
        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            Attempt::Terminal {
                status: status.as_u16(),
                error,
            }
        } else {
            Attempt::Retryable {
                status: Some(status.as_u16()),
                error,
            }
        }
    }

    fn transport_failure(&self, status: Option<u16>, e: reqwest::Error) -> Attempt {
        let error = if e.is_timeout() {
            format!("Timeout after {}s", self.config.timeout_secs)
        } else if e.is_decode() {
            format!("UnexpectedError: {}", e.without_url())
        } else {
            format!("ClientError: {}", e.without_url())
        };
        Attempt::Retryable { status, error }
    }

    /// Resolve one key, retrying transient failures.
    ///
    /// `limiter` bounds the number of concurrent requests across keys.
    pub async fn resolve_key(&self, key: &str, limiter: &Semaphore) -> ResolutionResult {
        let max_attempts = self.config.max_retries.max(1);
        let mut result = ResolutionResult {
            key: key.to_string(),
            resolved: false,
            metadata: None,
            error: None,
            status_code: None,
            attempts: 0,
        };

        for attempt in 1..=max_attempts {
            let outcome = {
                let _permit = match limiter.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        result.error = Some("UnexpectedError: request limiter closed".to_string());
                        break;
                    }
                };
                result.attempts = attempt;
                self.fetch_once(key).await
            };

            match outcome {
                Attempt::Resolved(metadata) => {
                    result.resolved = true;
                    result.metadata = Some(metadata);
                    result.status_code = Some(StatusCode::OK.as_u16());
                    result.error = None;
                    return result;
                }
                Attempt::Terminal { status, error } => {
                    result.status_code = Some(status);
                    result.error = Some(error);
                    break;
                }
                Attempt::Retryable { status, error } => {
                    if status.is_some() {
                        result.status_code = status;
                    }
                    debug!(doi = key, attempt, error = %error, "Registry request failed");
                    result.error = Some(error);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        result
    }

    /// Resolve every record's DOI and write the failure log.
    ///
    /// Returns one [`Resolution`] per record, parallel to `records`. The
    /// failure log at `failure_log` is overwritten, even when empty.
    pub async fn resolve_records(
        &self,
        records: &[Record],
        failure_log: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Resolution>> {
        let keys: Vec<String> = records
            .iter()
            .filter_map(Record::doi_key)
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let total = keys.len() as u64;
        info!(
            records = records.len(),
            unique_dois = total,
            concurrency = self.config.concurrency,
            "Resolving DOIs"
        );

        let mut completed = 0u64;
        let mut failures: Vec<DoiFailure> = Vec::new();
        let outcomes = fanout::run_async(
            keys.clone(),
            self.config.concurrency,
            |key, limiter| async move { self.resolve_key(&key, &limiter).await },
            |index, outcome| {
                completed += 1;
                progress.report(ProgressEvent::new(Stage::Doi, completed, total));
                match outcome {
                    Ok(result) if result.is_success() => {}
                    Ok(result) => {
                        warn!(doi = %result.key, attempts = result.attempts, error = ?result.error, "DOI resolution failed");
                        failures.push(result.to_failure());
                    }
                    Err(panic) => {
                        let unexpected = unexpected_result(&keys[index], panic);
                        warn!(doi = %keys[index], error = %panic, "DOI resolution panicked");
                        failures.push(unexpected.to_failure());
                    }
                }
            },
        )
        .await;

        let by_key: HashMap<&str, Resolution> = keys
            .iter()
            .zip(outcomes)
            .map(|(key, outcome)| {
                let resolution = match outcome {
                    Ok(result) => result.to_resolution(),
                    Err(panic) => unexpected_result(key, &panic).to_resolution(),
                };
                (key.as_str(), resolution)
            })
            .collect();

        persist::write_json_file(failure_log, &failures)?;
        info!(
            resolved = total as usize - failures.len(),
            failed = failures.len(),
            log = %failure_log.display(),
            "DOI resolution finished"
        );

        Ok(records
            .iter()
            .map(|record| match record.doi_key() {
                Some(key) => by_key
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| Resolution::failed("Unknown error".to_string())),
                None => Resolution::not_attempted(),
            })
            .collect())
    }
}

fn unexpected_result(key: &str, panic: &str) -> ResolutionResult {
    ResolutionResult {
        key: key.to_string(),
        resolved: false,
        metadata: None,
        error: Some(format!("UnexpectedError: {}", panic)),
        status_code: None,
        attempts: 0,
    }
}

fn metadata_payload(body: Value) -> Value {
    match body {
        Value::Object(mut object) => match object.remove("message") {
            Some(message) => message,
            None => Value::Object(object),
        },
        other => other,
    }
}
