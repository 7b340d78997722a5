//! Core data models used throughout the pipeline.
//!
//! These types represent the bibliographic records, per-key resolution
//! results, per-record extraction results, and failure log entries that flow
//! through ingestion, enrichment, and recovery.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One input bibliographic item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    /// Source identifier from the export (`id` column).
    pub source_id: String,
    /// Pre-existing or assigned record identifier.
    pub record_id: Option<String>,
    pub title: String,
    pub abstract_text: String,
    /// Normalized DOI, without resolver prefixes.
    pub doi: Option<String>,
    pub publication_year: Option<i64>,
    /// Publication type (`type` column).
    pub work_type: String,
    /// Set by preprocessing.
    pub has_abstract: Option<bool>,
    /// Set by preprocessing.
    pub manufacturing_context: Option<bool>,
    /// Remaining input columns, in encounter order.
    pub extra: Vec<(String, String)>,
}

impl Record {
    /// The registry key for this record, if it has a non-empty DOI.
    pub fn doi_key(&self) -> Option<&str> {
        self.doi
            .as_deref()
            .map(str::trim)
            .filter(|doi| !doi.is_empty())
    }

    pub fn year_text(&self) -> String {
        self.publication_year
            .map(|year| year.to_string())
            .unwrap_or_default()
    }

    pub fn record_id_or_empty(&self) -> &str {
        self.record_id.as_deref().unwrap_or("")
    }
}

/// Outcome of resolving one unique registry key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionResult {
    pub key: String,
    pub resolved: bool,
    pub metadata: Option<Value>,
    pub error: Option<String>,
    pub status_code: Option<u16>,
    /// Number of requests actually issued.
    pub attempts: u32,
}

impl ResolutionResult {
    /// A result only counts as resolved when it carries a metadata payload.
    pub fn is_success(&self) -> bool {
        self.resolved && matches!(&self.metadata, Some(meta) if !meta.is_null())
    }

    pub fn to_resolution(&self) -> Resolution {
        if self.is_success() {
            Resolution {
                resolved: true,
                error: None,
                metadata: self.metadata.clone(),
            }
        } else {
            Resolution::failed(
                self.error
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            )
        }
    }

    pub fn to_failure(&self) -> DoiFailure {
        DoiFailure {
            doi: self.key.clone(),
            error: self
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
            status_code: self.status_code,
            attempts: self.attempts,
            timestamp_utc: utc_now_iso(),
        }
    }
}

/// Per-record resolution annotation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub resolved: bool,
    pub error: Option<String>,
    pub metadata: Option<Value>,
}

impl Resolution {
    /// Records without a key are never attempted and carry no error.
    pub fn not_attempted() -> Self {
        Self::default()
    }

    pub fn failed(error: String) -> Self {
        Self {
            resolved: false,
            error: Some(error),
            metadata: None,
        }
    }
}

/// Per-record extraction outcome. Exactly one of a populated payload or an
/// error is meaningful: failed records carry the default payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub record_id: String,
    pub structured: Map<String, Value>,
    pub error: Option<String>,
    pub cache_hit: bool,
}

impl Extraction {
    pub fn succeeded(record_id: impl Into<String>, structured: Map<String, Value>) -> Self {
        Self {
            record_id: record_id.into(),
            structured,
            error: None,
            cache_hit: false,
        }
    }

    pub fn cached(record_id: impl Into<String>, structured: Map<String, Value>) -> Self {
        Self {
            cache_hit: true,
            ..Self::succeeded(record_id, structured)
        }
    }

    pub fn failed(record_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            structured: crate::schema::blank_payload(),
            error: Some(error.into()),
            cache_hit: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Entry of `failed_doi_log.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DoiFailure {
    pub doi: String,
    pub error: String,
    pub status_code: Option<u16>,
    pub attempts: u32,
    pub timestamp_utc: String,
}

/// Entry of `failed_llm_log.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LlmFailure {
    pub record_id: String,
    pub source_id: Option<String>,
    pub error: String,
    pub timestamp_utc: String,
}

impl LlmFailure {
    pub fn new(record_id: &str, source_id: &str, error: &str) -> Self {
        Self {
            record_id: record_id.to_string(),
            source_id: non_empty(source_id),
            error: error.to_string(),
            timestamp_utc: utc_now_iso(),
        }
    }
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Current UTC time as an RFC 3339 timestamp with microseconds and `+00:00`.
pub fn utc_now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Compact UTC stamp used in run IDs and snapshot file names.
///
/// The resolution is one second; use [`free_stamp`] when the stamp names a
/// file that must not be overwritten.
pub fn utc_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// `base`, or `base_2`, `base_3`, ... for the first candidate `taken`
/// rejects.
pub fn free_stamp(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
