//! End-to-end pipeline orchestration.
//!
//! ```text
//! input file ─► ingest ─► preprocess ─► record IDs ─► DOI resolution ─► LLM extraction
//!                                                                             │
//!                     logs/run_metadata_<run_id>.json ◄── final_dataset_<run_id>.csv
//! ```
//!
//! DOI resolution runs on the async runtime; extraction uses blocking HTTP
//! clients on a worker pool and runs inside `spawn_blocking`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::client::{self, ExtractionClient};
use crate::config::Config;
use crate::extractor::AbstractExtractor;
use crate::identity;
use crate::ingest;
use crate::models::{free_stamp, utc_now_iso, utc_stamp, Extraction, Record, Resolution};
use crate::persist;
use crate::preprocess;
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::resolver::DoiResolver;
use crate::schema::STRUCTURED_FIELDS;
use crate::table::{cell_from_value, flag_cell, Table};

/// Input columns that map onto [`Record`] fields, in output order.
const INPUT_COLUMNS: [&str; 6] = ["id", "title", "abstract", "doi", "publication_year", "type"];

const FLAG_COLUMNS: [&str; 2] = ["has_abstract", "manufacturing_context"];

const RESOLUTION_COLUMNS: [&str; 4] = [
    "doi_resolved",
    "doi_resolution_error",
    "doi_metadata",
    "record_id",
];

const PROVENANCE_COLUMNS: [&str; 8] = [
    "llm_extraction_error",
    "llm_provider",
    "llm_model",
    "run_id",
    "processed_at_utc",
    "pipeline_started_at_utc",
    "pipeline_completed_at_utc",
    "pipeline_seed",
];

/// Columns the pipeline writes itself. Input columns with these names are
/// replaced, never duplicated.
fn is_derived_column(name: &str) -> bool {
    INPUT_COLUMNS
        .iter()
        .chain(&FLAG_COLUMNS)
        .chain(&RESOLUTION_COLUMNS)
        .chain(&STRUCTURED_FIELDS)
        .chain(&PROVENANCE_COLUMNS)
        .any(|column| *column == name)
}

#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: String,
    pub output_csv: PathBuf,
    pub run_metadata: PathBuf,
    pub rows: usize,
}

#[derive(Serialize)]
struct RowCounts {
    ingested: usize,
    after_preprocess: usize,
    #[serde(rename = "final")]
    final_rows: usize,
}

#[derive(Serialize)]
struct FailureLogs {
    doi: String,
    llm: String,
}

#[derive(Serialize)]
struct RunMetadata {
    run_id: String,
    input_path: String,
    output_csv: String,
    started_at_utc: String,
    completed_at_utc: String,
    llm_provider: String,
    llm_model: String,
    llm_temperature: f64,
    seed: u64,
    row_counts: RowCounts,
    failure_logs: FailureLogs,
}

/// Provenance stamped onto every output row.
pub struct RunProvenance<'a> {
    pub run_id: &'a str,
    pub started_at: &'a str,
    pub completed_at: &'a str,
    pub seed: u64,
    pub provider: &'a str,
    pub model: &'a str,
}

fn snapshot_name(run_id: &str) -> String {
    format!("final_dataset_{}.csv", run_id)
}

fn metadata_name(run_id: &str) -> String {
    format!("run_metadata_{}.json", run_id)
}

/// Run the full pipeline with the backend selected by `config.llm.provider`.
///
/// The run ID is the start time in UTC seconds. A second run within the
/// same second gets a `_2`, `_3`, ... suffix instead of overwriting.
pub async fn run_pipeline(
    config: &Config,
    input: &Path,
    progress: Arc<dyn ProgressReporter>,
) -> Result<PipelineResult> {
    // Fail on missing credentials before any work is done.
    config.llm.api_key()?;
    let llm = config.llm.clone();
    run_with(config, input, progress, move || client::create_client(&llm)).await
}

/// Run the full pipeline with a caller-supplied extraction backend.
pub async fn run_pipeline_with_client(
    config: &Config,
    input: &Path,
    client: Arc<dyn ExtractionClient>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<PipelineResult> {
    run_with(config, input, progress, move || Ok(client)).await
}

async fn run_with<F>(
    config: &Config,
    input: &Path,
    progress: Arc<dyn ProgressReporter>,
    make_client: F,
) -> Result<PipelineResult>
where
    F: FnOnce() -> Result<Arc<dyn ExtractionClient>> + Send + 'static,
{
    config.ensure_directories()?;
    let started_at = utc_now_iso();
    let run_id = free_stamp(&utc_stamp(), |id| {
        config.output.dir.join(snapshot_name(id)).exists()
            || config.logs_dir().join(metadata_name(id)).exists()
    });
    info!(run_id = %run_id, input = %input.display(), "Pipeline started");

    progress.report(ProgressEvent::new(Stage::Ingestion, 0, 1));
    let raw = ingest::load_records(input)?;
    let ingested = raw.len();
    progress.report(ProgressEvent::new(Stage::Ingestion, 1, 1));

    progress.report(ProgressEvent::new(Stage::Preprocess, 0, 1));
    let records = identity::attach_record_ids(preprocess::preprocess_records(raw));
    let after_preprocess = records.len();
    progress.report(ProgressEvent::new(Stage::Preprocess, 1, 1));

    let resolver = DoiResolver::new(&config.registry)?;
    let resolutions = resolver
        .resolve_records(&records, &config.failed_doi_log_path(), progress.as_ref())
        .await?;

    let extract_config = config.clone();
    let extract_progress = Arc::clone(&progress);
    let (records, extractions, provider, model) = tokio::task::spawn_blocking(move || {
        let client = make_client()?;
        let extractor = AbstractExtractor::new(&extract_config, client)?;
        let extractions = extractor.extract_records(&records, extract_progress.as_ref())?;
        let provider = extractor.provider().to_string();
        let model = extractor.model().to_string();
        Ok::<_, anyhow::Error>((records, extractions, provider, model))
    })
    .await
    .with_context(|| "Extraction worker panicked")??;

    let completed_at = utc_now_iso();
    let provenance = RunProvenance {
        run_id: &run_id,
        started_at: &started_at,
        completed_at: &completed_at,
        seed: config.seed,
        provider: &provider,
        model: &model,
    };
    let table = build_output_table(&records, &resolutions, &extractions, &provenance)?;

    let output_csv = config.output.dir.join(snapshot_name(&run_id));
    table.write_csv(&output_csv)?;

    let run_metadata = config.logs_dir().join(metadata_name(&run_id));
    let metadata = RunMetadata {
        run_id: run_id.clone(),
        input_path: input.display().to_string(),
        output_csv: output_csv.display().to_string(),
        started_at_utc: started_at.clone(),
        completed_at_utc: completed_at.clone(),
        llm_provider: provider.clone(),
        llm_model: model.clone(),
        llm_temperature: config.llm.temperature,
        seed: config.seed,
        row_counts: RowCounts {
            ingested,
            after_preprocess,
            final_rows: table.len(),
        },
        failure_logs: FailureLogs {
            doi: config.failed_doi_log_path().display().to_string(),
            llm: config.failed_llm_log_path().display().to_string(),
        },
    };
    persist::write_json_file(&run_metadata, &metadata)?;

    info!(
        run_id = %run_id,
        rows = table.len(),
        output = %output_csv.display(),
        "Pipeline finished"
    );

    Ok(PipelineResult {
        run_id,
        output_csv,
        run_metadata,
        rows: table.len(),
    })
}

/// Merge records with their resolution and extraction results into the
/// final dataset. All three slices are parallel.
pub fn build_output_table(
    records: &[Record],
    resolutions: &[Resolution],
    extractions: &[Extraction],
    provenance: &RunProvenance<'_>,
) -> Result<Table> {
    let mut extra_columns: Vec<String> = Vec::new();
    for record in records {
        for (key, _) in &record.extra {
            if !is_derived_column(key) && !extra_columns.contains(key) {
                extra_columns.push(key.clone());
            }
        }
    }

    let mut columns: Vec<String> = INPUT_COLUMNS
        .iter()
        .chain(&FLAG_COLUMNS)
        .map(|c| c.to_string())
        .collect();
    columns.extend(extra_columns.iter().cloned());
    columns.extend(RESOLUTION_COLUMNS.iter().map(|c| c.to_string()));
    columns.extend(STRUCTURED_FIELDS.iter().map(|f| f.to_string()));
    columns.extend(PROVENANCE_COLUMNS.iter().map(|c| c.to_string()));

    let mut table = Table::new(columns);
    for ((record, resolution), extraction) in records.iter().zip(resolutions).zip(extractions) {
        let mut row = vec![
            record.source_id.clone(),
            record.title.clone(),
            record.abstract_text.clone(),
            record.doi.clone().unwrap_or_default(),
            record.year_text(),
            record.work_type.clone(),
            flag_cell(record.has_abstract),
            flag_cell(record.manufacturing_context),
        ];
        for column in &extra_columns {
            let value = record
                .extra
                .iter()
                .find(|(key, _)| key == column)
                .map(|(_, value)| value.clone())
                .unwrap_or_default();
            row.push(value);
        }
        row.push(flag_cell(Some(resolution.resolved)));
        row.push(resolution.error.clone().unwrap_or_default());
        row.push(
            resolution
                .metadata
                .as_ref()
                .map(cell_from_value)
                .unwrap_or_default(),
        );
        row.push(extraction.record_id.clone());
        for field in STRUCTURED_FIELDS {
            row.push(
                extraction
                    .structured
                    .get(field)
                    .map(cell_from_value)
                    .unwrap_or_default(),
            );
        }
        row.push(extraction.error.clone().unwrap_or_default());
        row.push(provenance.provider.to_string());
        row.push(provenance.model.to_string());
        row.push(provenance.run_id.to_string());
        row.push(provenance.completed_at.to_string());
        row.push(provenance.started_at.to_string());
        row.push(provenance.completed_at.to_string());
        row.push(provenance.seed.to_string());
        table.push_row(row)?;
    }
    Ok(table)
}
