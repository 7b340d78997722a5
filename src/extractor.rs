//! Abstract structuring.
//!
//! Turns each record's title and abstract into the structured field set
//! (see [`crate::schema`]) by rendering a prompt template, calling an
//! [`ExtractionClient`], and parsing the JSON object it returns.
//!
//! Successful responses are cached per record in
//! `<output>/llm_responses/<record_id>.json`. A later run finds the cache
//! file and skips the backend call unless overwriting is enabled, so an
//! interrupted run can be restarted without paying for finished records.
//!
//! Records run on a fixed-size worker pool. A failure (transport error,
//! malformed output, even a panic) is confined to its record: the record
//! keeps default field values plus an error string, and is listed in
//! `logs/failed_llm_log.json` for [`crate::recovery`].

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::ExtractionClient;
use crate::config::Config;
use crate::fanout;
use crate::identity;
use crate::models::{non_empty, utc_now_iso, Extraction, LlmFailure, Record};
use crate::persist;
use crate::progress::{ProgressEvent, ProgressReporter, Stage};

pub use crate::schema::normalize_payload;

/// On-disk form of a cached response.
#[derive(Serialize)]
struct CachedResponse<'a> {
    record_id: &'a str,
    source_id: Option<String>,
    provider: &'a str,
    model: &'a str,
    processed_at_utc: String,
    structured: &'a Map<String, Value>,
    raw_response: &'a str,
}

pub struct AbstractExtractor {
    client: Arc<dyn ExtractionClient>,
    template: String,
    responses_dir: PathBuf,
    failure_log: PathBuf,
    max_workers: usize,
    overwrite: bool,
}

impl AbstractExtractor {
    /// Create an extractor, reading the prompt template named in the config.
    pub fn new(config: &Config, client: Arc<dyn ExtractionClient>) -> Result<Self> {
        let path = &config.llm.prompt_template;
        let template = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt template: {}", path.display()))?;
        Ok(Self::with_template(config, client, template))
    }

    pub fn with_template(
        config: &Config,
        client: Arc<dyn ExtractionClient>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            client,
            template: template.into(),
            responses_dir: config.responses_dir(),
            failure_log: config.failed_llm_log_path(),
            max_workers: config.llm.max_workers,
            overwrite: config.llm.overwrite_existing_responses,
        }
    }

    pub fn provider(&self) -> &str {
        self.client.provider()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub fn response_path(&self, record_id: &str) -> PathBuf {
        self.responses_dir.join(format!("{}.json", record_id))
    }

    /// Extract one record, consulting the response cache first.
    pub fn extract_one(&self, record: &Record, record_id: &str) -> Extraction {
        let path = self.response_path(record_id);
        if !self.overwrite && path.exists() {
            if let Some(structured) = load_cached_response(&path) {
                debug!(record_id, "Using cached LLM response");
                return Extraction::cached(record_id, structured);
            }
        }

        match self.call_backend(record, record_id, &path) {
            Ok(structured) => Extraction::succeeded(record_id, structured),
            Err(e) => Extraction::failed(record_id, format!("{:#}", e)),
        }
    }

    fn call_backend(
        &self,
        record: &Record,
        record_id: &str,
        path: &Path,
    ) -> Result<Map<String, Value>> {
        let prompt = render_prompt(&self.template, record);
        let raw = self.client.generate(&prompt)?;
        let structured = parse_structured(&raw)?;
        let cached = CachedResponse {
            record_id,
            source_id: non_empty(&record.source_id),
            provider: self.client.provider(),
            model: self.client.model(),
            processed_at_utc: utc_now_iso(),
            structured: &structured,
            raw_response: &raw,
        };
        persist::write_json_file(path, &cached)?;
        Ok(structured)
    }

    /// Extract every record on the worker pool.
    ///
    /// Record IDs are (re)derived from `records` with
    /// [`identity::assign_record_ids`]. Returns one [`Extraction`] per record,
    /// in input order, and overwrites the failure log.
    pub fn extract_records(
        &self,
        records: &[Record],
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Extraction>> {
        let record_ids = identity::assign_record_ids(records);
        let total = records.len() as u64;
        info!(
            records = records.len(),
            workers = self.max_workers,
            provider = self.provider(),
            model = self.model(),
            "Starting LLM extraction"
        );

        let units: Vec<(usize, &Record, &str)> = records
            .iter()
            .zip(record_ids.iter())
            .enumerate()
            .map(|(index, (record, id))| (index, record, id.as_str()))
            .collect();

        let mut completed = 0u64;
        let mut failures: Vec<LlmFailure> = Vec::new();
        let outcomes = fanout::run_pool(
            units,
            self.max_workers,
            |(index, record, record_id)| (index, self.extract_one(record, record_id)),
            |index, outcome| {
                completed += 1;
                progress.report(ProgressEvent::new(Stage::Llm, completed, total));
                let error = match outcome {
                    Ok((_, extraction)) => extraction.error.clone(),
                    Err(panic) => Some(format!("Unhandled exception: {}", panic)),
                };
                if let Some(error) = error {
                    warn!(record_id = %record_ids[index], error = %error, "LLM extraction failed");
                    failures.push(LlmFailure::new(
                        &record_ids[index],
                        &records[index].source_id,
                        &error,
                    ));
                }
            },
        )?;

        let mut by_key: HashMap<(usize, String), Extraction> = outcomes
            .into_iter()
            .enumerate()
            .map(|(slot, outcome)| match outcome {
                Ok((index, extraction)) => ((index, extraction.record_id.clone()), extraction),
                Err(panic) => (
                    (slot, record_ids[slot].clone()),
                    Extraction::failed(
                        record_ids[slot].clone(),
                        format!("Unhandled exception: {}", panic),
                    ),
                ),
            })
            .collect();

        let merged: Vec<Extraction> = record_ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                by_key
                    .remove(&(index, id.clone()))
                    .unwrap_or_else(|| Extraction::failed(id.clone(), "Missing extraction result"))
            })
            .collect();

        persist::write_json_file(&self.failure_log, &failures)?;
        let cache_hits = merged.iter().filter(|e| e.cache_hit).count();
        info!(
            succeeded = merged.len() - failures.len(),
            failed = failures.len(),
            cache_hits,
            log = %self.failure_log.display(),
            "LLM extraction finished"
        );
        Ok(merged)
    }
}

/// Substitute `{title}`, `{publication_year}`, `{publication_type}`, and
/// `{abstract}` into `template`, in that order.
pub fn render_prompt(template: &str, record: &Record) -> String {
    let replacements = [
        ("{title}", record.title.clone()),
        ("{publication_year}", record.year_text()),
        ("{publication_type}", record.work_type.clone()),
        ("{abstract}", record.abstract_text.clone()),
    ];
    replacements
        .iter()
        .fold(template.to_string(), |prompt, (token, value)| {
            prompt.replace(token, value)
        })
}

/// Strip a surrounding Markdown code fence (```` ``` ```` or ```` ```json ````).
pub fn clean_json_text(raw: &str) -> String {
    let text = raw.trim();
    let Some(body) = text.strip_prefix("```") else {
        return text.to_string();
    };
    let body = match body.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => &body[4..],
        _ => body,
    };
    let body = body.trim_start();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Parse backend output into a normalized structured payload.
pub fn parse_structured(raw: &str) -> Result<Map<String, Value>> {
    let cleaned = clean_json_text(raw);
    let parsed: Value =
        serde_json::from_str(&cleaned).with_context(|| "LLM output was not valid JSON")?;
    match parsed {
        Value::Object(object) => Ok(normalize_payload(&object)),
        _ => bail!("LLM output JSON was not an object."),
    }
}

/// Load a cached response. Returns `None` when the file is unreadable or
/// carries no `structured` object.
pub fn load_cached_response(path: &Path) -> Option<Map<String, Value>> {
    let content = std::fs::read_to_string(path).ok()?;
    let payload: Value = serde_json::from_str(&content).ok()?;
    match payload.get("structured") {
        Some(Value::Object(structured)) => Some(normalize_payload(structured)),
        _ => None,
    }
}
