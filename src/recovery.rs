//! Recovery of failed LLM extractions.
//!
//! Re-runs extraction for the record IDs listed in
//! `logs/failed_llm_log.json` and patches the successes into the most
//! recent `final_dataset_*.csv`, writing a new
//! `final_dataset_<stamp>_recovered.csv` plus a
//! `logs/recovery_report_<stamp>.json`. Rows that did not fail are copied
//! through unchanged.
//! A recovery in the same second as an earlier one gets a `_2`, `_3`,
//! ... suffix on its stamp.
//!
//! Record IDs are re-derived from the original input (ingest, preprocess,
//! assign IDs), so the same input file must be passed. When none of the
//! failed IDs can be found that way, the descriptive columns of the latest
//! snapshot are used instead.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

use crate::client::{self, ExtractionClient};
use crate::config::Config;
use crate::extractor::AbstractExtractor;
use crate::identity;
use crate::ingest;
use crate::models::{free_stamp, utc_now_iso, utc_stamp, Extraction, Record};
use crate::persist;
use crate::preprocess;
use crate::progress::ProgressReporter;
use crate::schema::STRUCTURED_FIELDS;
use crate::table::{cell_from_value, Table};

const ERROR_COLUMN: &str = "llm_extraction_error";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecoveryReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_rows_requested: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_retried: Option<usize>,
    pub recovered_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_latest_csv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_csv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Where this report was written, when it was.
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

impl RecoveryReport {
    fn nothing_to_do(message: &str) -> Self {
        Self {
            failed_rows_requested: None,
            rows_retried: None,
            recovered_rows: 0,
            source_latest_csv: None,
            output_csv: None,
            message: Some(message.to_string()),
            report_path: None,
        }
    }
}

/// Recover failed rows with the backend selected by `config.llm.provider`.
///
/// Blocking: call from a blocking context (e.g. `spawn_blocking`).
pub fn recover_failed_rows(
    config: &Config,
    input: &Path,
    progress: &dyn ProgressReporter,
) -> Result<RecoveryReport> {
    recover_with(config, input, progress, || client::create_client(&config.llm))
}

/// Recover failed rows with a caller-supplied extraction backend.
pub fn recover_failed_rows_with_client(
    config: &Config,
    input: &Path,
    client: Arc<dyn ExtractionClient>,
    progress: &dyn ProgressReporter,
) -> Result<RecoveryReport> {
    recover_with(config, input, progress, || Ok(client))
}

fn recover_with<F>(
    config: &Config,
    input: &Path,
    progress: &dyn ProgressReporter,
    make_client: F,
) -> Result<RecoveryReport>
where
    F: FnOnce() -> Result<Arc<dyn ExtractionClient>>,
{
    config.ensure_directories()?;

    let failed_ids = load_failed_record_ids(&config.failed_llm_log_path())?;
    if failed_ids.is_empty() {
        info!("No failed LLM rows to recover");
        return Ok(RecoveryReport::nothing_to_do("No failed rows found."));
    }
    let wanted: HashSet<&str> = failed_ids.iter().map(String::as_str).collect();

    let source = identity::attach_record_ids(preprocess::preprocess_records(
        ingest::load_records(input)?,
    ));
    let latest = latest_snapshot(&config.output.dir)?;
    let mut table = Table::read_csv(&latest)?;
    if table.column_index("record_id").is_none() {
        bail!(
            "Latest output file does not contain a record_id column: {}",
            latest.display()
        );
    }

    let mut subset: Vec<Record> = source
        .into_iter()
        .filter(|record| wanted.contains(record.record_id_or_empty()))
        .collect();
    if subset.is_empty() {
        warn!(
            snapshot = %latest.display(),
            "Failed record IDs not found in input; retrying from snapshot rows"
        );
        subset = records_from_snapshot(&table, &wanted);
    }
    if subset.is_empty() {
        info!("No matching failed rows found in source data");
        return Ok(RecoveryReport::nothing_to_do("No matching failed rows."));
    }

    info!(
        failed = failed_ids.len(),
        retrying = subset.len(),
        snapshot = %latest.display(),
        "Recovering failed LLM rows"
    );

    let recovery_config = config.clone().with_overwrite(true);
    let extractor = AbstractExtractor::new(&recovery_config, make_client()?)?;
    let extractions = extractor.extract_records(&subset, progress)?;

    let mut seen: HashSet<&str> = HashSet::new();
    let patches: Vec<&Extraction> = extractions
        .iter()
        .filter(|e| e.is_success())
        .filter(|e| seen.insert(e.record_id.as_str()))
        .collect();
    let recovered = apply_patch(&mut table, &patches, extractor.provider(), extractor.model());
    table.set_column("recovery_applied_at_utc", &utc_now_iso());

    let recovered_name = |stamp: &str| format!("final_dataset_{}_recovered.csv", stamp);
    let report_name = |stamp: &str| format!("recovery_report_{}.json", stamp);
    let stamp = free_stamp(&utc_stamp(), |stamp| {
        config.output.dir.join(recovered_name(stamp)).exists()
            || config.logs_dir().join(report_name(stamp)).exists()
    });
    let output_csv = config.output.dir.join(recovered_name(&stamp));
    table.write_csv(&output_csv)?;

    let report_path = config.logs_dir().join(report_name(&stamp));
    let report = RecoveryReport {
        failed_rows_requested: Some(failed_ids.len()),
        rows_retried: Some(subset.len()),
        recovered_rows: patches.len(),
        source_latest_csv: Some(latest.display().to_string()),
        output_csv: Some(output_csv.display().to_string()),
        message: None,
        report_path: Some(report_path.clone()),
    };
    persist::write_json_file(&report_path, &report)?;

    info!(
        recovered = patches.len(),
        patched_rows = recovered,
        output = %output_csv.display(),
        "Recovery finished"
    );
    Ok(report)
}

/// Record IDs listed in a failure log. A missing log means no failures.
pub fn load_failed_record_ids(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let payload: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let ids = payload
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("record_id").and_then(Value::as_str))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(ids)
}

/// The most recently modified `final_dataset_*.csv` in `dir`.
pub fn latest_snapshot(dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("No final dataset CSV files found in {}", dir.display()))?;
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("final_dataset_") && name.ends_with(".csv")) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let candidate = (modified, entry.path());
        if latest.as_ref().map_or(true, |current| candidate >= *current) {
            latest = Some(candidate);
        }
    }
    match latest {
        Some((_, path)) => Ok(path),
        None => bail!("No final dataset CSV files found in {}", dir.display()),
    }
}

fn records_from_snapshot(table: &Table, wanted: &HashSet<&str>) -> Vec<Record> {
    let Some(id_col) = table.column_index("record_id") else {
        return Vec::new();
    };
    let column = |row: &[String], name: &str| -> String {
        table
            .column_index(name)
            .map(|col| row[col].clone())
            .unwrap_or_default()
    };
    table
        .rows
        .iter()
        .filter(|row| wanted.contains(row[id_col].as_str()))
        .map(|row| Record {
            record_id: Some(row[id_col].clone()),
            source_id: column(row, "id"),
            title: column(row, "title"),
            abstract_text: column(row, "abstract"),
            publication_year: ingest::parse_year(&Value::String(column(row, "publication_year"))),
            work_type: column(row, "type"),
            ..Default::default()
        })
        .collect()
}

/// Patch successful extractions into `table`, matched on `record_id`.
///
/// Non-null values overwrite the existing cell; nulls leave it alone;
/// columns the table does not have are skipped. The error column is cleared
/// on every patched row. Returns the number of rows touched.
pub fn apply_patch(
    table: &mut Table,
    patches: &[&Extraction],
    provider: &str,
    model: &str,
) -> usize {
    let Some(id_col) = table.column_index("record_id") else {
        return 0;
    };
    let by_id: HashMap<&str, &Extraction> =
        patches.iter().map(|e| (e.record_id.as_str(), *e)).collect();

    let field_cols: Vec<(usize, &str)> = STRUCTURED_FIELDS
        .iter()
        .filter_map(|field| table.column_index(field).map(|col| (col, *field)))
        .collect();
    let provider_col = table.column_index("llm_provider");
    let model_col = table.column_index("llm_model");
    let error_col = table.column_index(ERROR_COLUMN);

    let mut touched = 0;
    for row in &mut table.rows {
        let Some(extraction) = by_id.get(row[id_col].as_str()) else {
            continue;
        };
        for (col, field) in &field_cols {
            match extraction.structured.get(*field) {
                Some(Value::Null) | None => {}
                Some(value) => row[*col] = cell_from_value(value),
            }
        }
        if let Some(col) = provider_col {
            row[col] = provider.to_string();
        }
        if let Some(col) = model_col {
            row[col] = model.to_string();
        }
        if let Some(col) = error_col {
            row[col] = String::new();
        }
        touched += 1;
    }
    touched
}
