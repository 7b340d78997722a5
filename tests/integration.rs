use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn litrev_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_litrev"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();
    fs::write(
        data_dir.join("works.csv"),
        "id,title,abstract,doi,publication_year,type\n\
         W1,Vision inspection,Defect detection on the shop floor.,,2023,article\n\
         W2,Language models,Summarizing maintenance logs.,,2022,article\n",
    )
    .unwrap();

    let config_content = format!(
        r#"seed = 7

[output]
dir = "{}/output"

[logging]
level = "warn"

[llm]
provider = "gemini"
prompt_template = "{}/prompt.txt"

[llm.gemini]
api_key_env = "LITREV_CLI_TEST_UNSET_KEY"
"#,
        root.display(),
        root.display()
    );
    fs::write(root.join("prompt.txt"), "{title}\n{abstract}\n").unwrap();

    let config_path = config_dir.join("litrev.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_litrev(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = litrev_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("LITREV_CLI_TEST_UNSET_KEY")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run litrev binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_commands() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, success) = run_litrev(&config, &["--help"]);
    assert!(success);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("recover"));
    drop(tmp);
}

#[test]
fn test_run_without_api_key_fails() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("data/works.csv");
    let (_, stderr, success) = run_litrev(
        &config,
        &["run", "--input", input.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!success, "run should fail without credentials");
    assert!(
        stderr.contains("LITREV_CLI_TEST_UNSET_KEY is required"),
        "stderr={}",
        stderr
    );
    let snapshots = fs::read_dir(tmp.path().join("output"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("final_dataset_"))
        .count();
    assert_eq!(snapshots, 0);
}

#[test]
fn test_unknown_provider_is_rejected() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("data/works.csv");
    let (_, stderr, success) = run_litrev(
        &config,
        &["run", "--input", input.to_str().unwrap(), "--llm-provider", "claude"],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown LLM provider"), "stderr={}", stderr);
}

#[test]
fn test_recover_with_nothing_to_do() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("data/works.csv");
    let (stdout, stderr, success) = run_litrev(
        &config,
        &["recover", "--input", input.to_str().unwrap(), "--progress", "off"],
    );
    assert!(success, "recover failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("recovered_rows: 0"), "stdout={}", stdout);
    assert!(stdout.contains("message: No failed rows found."), "stdout={}", stdout);
    assert!(tmp.path().join("output/logs/pipeline.log").exists());
}

#[test]
fn test_output_dir_override() {
    let (tmp, config) = setup_test_env();
    let input = tmp.path().join("data/works.csv");
    let elsewhere = tmp.path().join("elsewhere");
    let (_, stderr, success) = run_litrev(
        &config,
        &[
            "recover",
            "--input",
            input.to_str().unwrap(),
            "--output-dir",
            elsewhere.to_str().unwrap(),
        ],
    );
    assert!(success, "stderr={}", stderr);
    assert!(elsewhere.join("logs").is_dir());
    assert!(!tmp.path().join("output").exists());
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, config) = setup_test_env();
    fs::write(&config, "[registry]\nconcurrency = \"many\"\n").unwrap();
    let input = tmp.path().join("data/works.csv");
    let (_, stderr, success) = run_litrev(&config, &["recover", "--input", input.to_str().unwrap()]);
    assert!(!success);
    assert!(!stderr.is_empty());
}

#[test]
fn test_missing_config_uses_defaults() {
    let (tmp, _config) = setup_test_env();
    let missing = tmp.path().join("config/absent.toml");
    let input = tmp.path().join("data/works.csv");
    let elsewhere = tmp.path().join("defaults_out");
    let (stdout, stderr, success) = run_litrev(
        &missing,
        &[
            "recover",
            "--input",
            input.to_str().unwrap(),
            "--output-dir",
            elsewhere.to_str().unwrap(),
        ],
    );
    assert!(success, "stderr={}", stderr);
    assert!(stdout.contains("No failed rows found."));
}
