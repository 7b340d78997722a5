//! End-to-end runs: pipeline snapshot, then recovery of failed rows.

mod common;

use axum::extract::Path as AxumPath;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use common::{test_config, write_input, ScriptedClient};
use lit_review_pipeline::config::Config;
use lit_review_pipeline::pipeline::{run_pipeline, run_pipeline_with_client, PipelineResult};
use lit_review_pipeline::progress::NoProgress;
use lit_review_pipeline::recovery::{recover_failed_rows_with_client, RecoveryReport};
use lit_review_pipeline::schema::STRUCTURED_FIELDS;
use lit_review_pipeline::table::Table;

async fn work(AxumPath(key): AxumPath<String>) -> Json<Value> {
    Json(json!({"status": "ok", "message": {"DOI": key, "publisher": "Mock Press"}}))
}

fn pipeline_config(tmp: &TempDir) -> Config {
    let base = common::spawn_server(Router::new().route("/works/{*key}", get(work)));
    let mut config = test_config(tmp);
    config.registry.base_url = format!("{}/works", base);
    config
}

fn sample_input(tmp: &TempDir) -> std::path::PathBuf {
    write_input(
        tmp.path(),
        &[
            ("W3", "Flaky paper", "Scheduling on the shop floor.", ""),
            ("W1", "Vision inspection", "Defect detection in  manufacturing.", "https://doi.org/10.1000/A1"),
            ("W4", "No abstract", "   ", "10.1000/a4"),
            ("W2", "Language models", "Summarizing maintenance logs.", "doi:10.1000/a2"),
        ],
    )
}

async fn run(config: &Config, input: &std::path::Path, client: Arc<ScriptedClient>) -> PipelineResult {
    run_pipeline_with_client(config, input, client, Arc::new(NoProgress))
        .await
        .unwrap()
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn row_of(table: &Table, record_id: &str) -> usize {
    (0..table.len())
        .find(|&row| table.cell(row, "record_id") == Some(record_id))
        .unwrap()
}

#[tokio::test]
async fn pipeline_writes_snapshot_and_metadata() {
    let tmp = TempDir::new().unwrap();
    let config = pipeline_config(&tmp);
    let input = sample_input(&tmp);

    let result = run(&config, &input, ScriptedClient::failing_on("Flaky")).await;
    assert_eq!(result.rows, 3);
    assert!(result.output_csv.exists());
    assert!(result
        .output_csv
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("final_dataset_"));

    let table = Table::read_csv(&result.output_csv).unwrap();
    for column in ["id", "record_id", "doi_resolved", "llm_extraction_error", "run_id"] {
        assert!(table.column_index(column).is_some(), "{}", column);
    }
    for field in STRUCTURED_FIELDS {
        assert!(table.column_index(field).is_some(), "{}", field);
    }

    let ids: Vec<&str> = (0..table.len()).map(|r| table.cell(r, "id").unwrap()).collect();
    assert_eq!(ids, vec!["W1", "W2", "W3"]);

    assert_eq!(table.cell(0, "doi"), Some("10.1000/A1"));
    assert_eq!(table.cell(0, "doi_resolved"), Some("1"));
    assert_eq!(table.cell(0, "manufacturing_context"), Some("1"));
    assert_eq!(table.cell(0, "abstract"), Some("Defect detection in manufacturing."));
    let metadata: Value = serde_json::from_str(table.cell(0, "doi_metadata").unwrap()).unwrap();
    assert_eq!(metadata["publisher"], json!("Mock Press"));

    assert_eq!(table.cell(1, "doi"), Some("10.1000/a2"));
    assert_eq!(table.cell(1, "manufacturing_context"), Some("0"));

    assert_eq!(table.cell(2, "doi_resolved"), Some("0"));
    assert_eq!(table.cell(2, "doi_resolution_error"), Some(""));
    assert_eq!(table.cell(2, "llm_extraction_error"), Some("backend unavailable"));
    assert_eq!(table.cell(2, "ai_category"), Some(""));
    assert_eq!(table.cell(0, "ai_category"), Some("category for Vision inspection"));
    assert_eq!(table.cell(0, "kpis"), Some("[\"oee\"]"));

    for row in 0..table.len() {
        assert_eq!(table.cell(row, "run_id"), Some(result.run_id.as_str()));
        assert_eq!(table.cell(row, "llm_provider"), Some("scripted"));
        assert_eq!(table.cell(row, "pipeline_seed"), Some(config.seed.to_string().as_str()));
    }

    let meta = read_json(&result.run_metadata);
    assert_eq!(meta["run_id"], json!(result.run_id));
    assert_eq!(meta["row_counts"]["ingested"], json!(4));
    assert_eq!(meta["row_counts"]["after_preprocess"], json!(3));
    assert_eq!(meta["row_counts"]["final"], json!(3));
    assert_eq!(meta["llm_model"], json!("scripted-1"));

    let llm_log = read_json(&config.failed_llm_log_path());
    assert_eq!(llm_log.as_array().unwrap().len(), 1);
    assert_eq!(llm_log[0]["record_id"], json!("W3"));
    assert_eq!(read_json(&config.failed_doi_log_path()), json!([]));
}

#[tokio::test]
async fn recovery_patches_only_failed_rows() {
    let tmp = TempDir::new().unwrap();
    let config = pipeline_config(&tmp);
    let input = sample_input(&tmp);
    let result = run(&config, &input, ScriptedClient::failing_on("Flaky")).await;
    let before = Table::read_csv(&result.output_csv).unwrap();

    let retry = ScriptedClient::echo();
    let report = recover_failed_rows_with_client(&config, &input, retry.clone(), &NoProgress).unwrap();
    assert_eq!(retry.calls(), 1);
    assert_eq!(report.failed_rows_requested, Some(1));
    assert_eq!(report.rows_retried, Some(1));
    assert_eq!(report.recovered_rows, 1);
    assert_eq!(
        report.source_latest_csv.as_deref(),
        Some(result.output_csv.display().to_string().as_str())
    );

    let output = std::path::PathBuf::from(report.output_csv.clone().unwrap());
    assert!(output.to_string_lossy().ends_with("_recovered.csv"));
    let after = Table::read_csv(&output).unwrap();
    assert_eq!(after.len(), before.len());
    assert_eq!(&after.columns[..before.columns.len()], &before.columns[..]);
    assert!(after.column_index("recovery_applied_at_utc").is_some());

    let patched = row_of(&after, "W3");
    assert_eq!(after.cell(patched, "ai_category"), Some("category for Flaky paper"));
    assert_eq!(after.cell(patched, "llm_extraction_error"), Some(""));
    assert_eq!(after.cell(patched, "llm_provider"), Some("scripted"));

    for id in ["W1", "W2"] {
        let old = &before.rows[row_of(&before, id)];
        let new = &after.rows[row_of(&after, id)];
        assert_eq!(&new[..old.len()], &old[..], "row {} changed", id);
    }

    let report_path = report.report_path.clone().unwrap();
    let written = read_json(&report_path);
    assert_eq!(written["recovered_rows"], json!(1));
    assert!(written.get("message").is_none());

    let again = recover_failed_rows_with_client(&config, &input, retry.clone(), &NoProgress).unwrap();
    assert_eq!(again.message.as_deref(), Some("No failed rows found."));
    assert_eq!(retry.calls(), 1);
}

#[test]
fn recovery_without_failure_log_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let input = write_input(tmp.path(), &[("W1", "T", "A", "")]);
    let client = ScriptedClient::echo();

    let report = recover_failed_rows_with_client(&config, &input, client.clone(), &NoProgress).unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            failed_rows_requested: None,
            rows_retried: None,
            recovered_rows: 0,
            source_latest_csv: None,
            output_csv: None,
            message: Some("No failed rows found.".to_string()),
            report_path: None,
        }
    );
    assert_eq!(client.calls(), 0);
}

#[test]
fn recovery_without_snapshot_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    config.ensure_directories().unwrap();
    std::fs::write(
        config.failed_llm_log_path(),
        json!([{"record_id": "W1", "error": "boom"}]).to_string(),
    )
    .unwrap();
    let input = write_input(tmp.path(), &[("W1", "T", "A", "")]);

    let err = recover_failed_rows_with_client(&config, &input, ScriptedClient::echo(), &NoProgress)
        .unwrap_err();
    assert!(err.to_string().contains("No final dataset CSV files found"), "{}", err);
}

#[test]
fn unknown_failed_ids_are_not_retried() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    config.ensure_directories().unwrap();
    let mut snapshot = Table::new(vec!["id".into(), "record_id".into(), "ai_category".into()]);
    snapshot
        .push_row(vec!["W1".into(), "W1".into(), "x".into()])
        .unwrap();
    snapshot
        .write_csv(&config.output.dir.join("final_dataset_20240101T000000Z.csv"))
        .unwrap();
    std::fs::write(
        config.failed_llm_log_path(),
        json!([{"record_id": "ghost", "error": "boom"}]).to_string(),
    )
    .unwrap();
    let input = write_input(tmp.path(), &[("W1", "T", "A", "")]);
    let client = ScriptedClient::echo();

    let report = recover_failed_rows_with_client(&config, &input, client.clone(), &NoProgress).unwrap();
    assert_eq!(report.message.as_deref(), Some("No matching failed rows."));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn missing_api_key_fails_before_any_output() {
    let tmp = TempDir::new().unwrap();
    let mut config = pipeline_config(&tmp);
    config.llm.gemini.api_key_env = "LITREV_TEST_KEY_THAT_IS_NEVER_SET".to_string();
    let input = sample_input(&tmp);

    let err = run_pipeline(&config, &input, Arc::new(NoProgress))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("LITREV_TEST_KEY_THAT_IS_NEVER_SET"),
        "{}",
        err
    );
    let produced = std::fs::read_dir(&config.output.dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(produced, 0);
}

#[tokio::test]
async fn input_columns_do_not_shadow_pipeline_columns() {
    let tmp = TempDir::new().unwrap();
    let config = pipeline_config(&tmp);
    let input = tmp.path().join("works.csv");
    std::fs::write(
        &input,
        "id,title,abstract,doi,ai_category,llm_extraction_error,venue\n\
         W1,Vision inspection,Defect detection.,,stale,old,Journal of Tests\n",
    )
    .unwrap();

    let result = run(&config, &input, ScriptedClient::echo()).await;
    let table = Table::read_csv(&result.output_csv).unwrap();
    for name in ["ai_category", "llm_extraction_error"] {
        let headers = table.columns.iter().filter(|c| c.as_str() == name).count();
        assert_eq!(headers, 1, "{}", name);
    }
    assert_eq!(table.cell(0, "ai_category"), Some("category for Vision inspection"));
    assert_eq!(table.cell(0, "llm_extraction_error"), Some(""));
    assert_eq!(table.cell(0, "venue"), Some("Journal of Tests"));
}

#[tokio::test]
async fn recovery_keeps_rows_that_fail_again() {
    let tmp = TempDir::new().unwrap();
    let config = pipeline_config(&tmp);
    let input = write_input(
        tmp.path(),
        &[
            ("W1", "Flaky one", "First abstract.", ""),
            ("W2", "Steady", "Second abstract.", ""),
            ("W3", "Flaky two", "Third abstract.", ""),
        ],
    );
    let result = run(&config, &input, ScriptedClient::failing_on("Flaky")).await;
    let before = Table::read_csv(&result.output_csv).unwrap();

    let retry = ScriptedClient::failing_on("one");
    let report = recover_failed_rows_with_client(&config, &input, retry.clone(), &NoProgress).unwrap();
    assert_eq!(retry.calls(), 2);
    assert_eq!(report.failed_rows_requested, Some(2));
    assert_eq!(report.rows_retried, Some(2));
    assert_eq!(report.recovered_rows, 1);

    let after = Table::read_csv(std::path::Path::new(report.output_csv.as_deref().unwrap())).unwrap();
    let still_failed = row_of(&after, "W1");
    let old = &before.rows[row_of(&before, "W1")];
    assert_eq!(&after.rows[still_failed][..old.len()], &old[..]);
    assert_eq!(after.cell(still_failed, "llm_extraction_error"), Some("backend unavailable"));
    assert_eq!(after.cell(still_failed, "ai_category"), Some(""));

    let recovered = row_of(&after, "W3");
    assert_eq!(after.cell(recovered, "llm_extraction_error"), Some(""));
    assert_eq!(after.cell(recovered, "ai_category"), Some("category for Flaky two"));

    let log = read_json(&config.failed_llm_log_path());
    let ids: Vec<&str> = log
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["record_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["W1"]);
}

#[tokio::test]
async fn recovery_falls_back_to_snapshot_rows() {
    let tmp = TempDir::new().unwrap();
    let config = pipeline_config(&tmp);
    let input = sample_input(&tmp);
    run(&config, &input, ScriptedClient::failing_on("Flaky")).await;

    let other_dir = tmp.path().join("other");
    std::fs::create_dir_all(&other_dir).unwrap();
    let other_input = write_input(&other_dir, &[("X9", "Unrelated", "Nothing in common.", "")]);

    let retry = ScriptedClient::echo();
    let report =
        recover_failed_rows_with_client(&config, &other_input, retry.clone(), &NoProgress).unwrap();
    assert_eq!(retry.calls(), 1);
    assert_eq!(report.rows_retried, Some(1));
    assert_eq!(report.recovered_rows, 1);

    let after = Table::read_csv(std::path::Path::new(report.output_csv.as_deref().unwrap())).unwrap();
    assert_eq!(after.len(), 3);
    let patched = row_of(&after, "W3");
    assert_eq!(after.cell(patched, "ai_category"), Some("category for Flaky paper"));
    assert_eq!(after.cell(patched, "llm_extraction_error"), Some(""));
    assert!((0..after.len()).all(|r| after.cell(r, "id") != Some("X9")));
}

#[tokio::test]
async fn back_to_back_runs_keep_separate_snapshots() {
    let tmp = TempDir::new().unwrap();
    let config = pipeline_config(&tmp);
    let input = sample_input(&tmp);

    let first = run(&config, &input, ScriptedClient::echo()).await;
    let second = run(&config, &input, ScriptedClient::echo()).await;
    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.output_csv, second.output_csv);
    assert_ne!(first.run_metadata, second.run_metadata);
    assert!(first.output_csv.exists());
    assert!(second.output_csv.exists());
}
