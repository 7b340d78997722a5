//! # Literature Review Pipeline CLI (`litrev`)
//!
//! ## Usage
//!
//! ```bash
//! litrev --config ./config/litrev.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `litrev run --input <file>` | Ingest, resolve DOIs, extract, and write a snapshot |
//! | `litrev recover --input <file>` | Retry failed LLM rows and patch the latest snapshot |
//!
//! ## Examples
//!
//! ```bash
//! # Full run with OpenAI instead of the configured provider
//! litrev run --input data/works.json --llm-provider openai
//!
//! # Machine-readable progress on stderr
//! litrev run --input data/works.csv --progress json
//!
//! # Retry failures into a new *_recovered.csv snapshot
//! litrev recover --input data/works.json
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use lit_review_pipeline::config::{self, Config, Provider};
use lit_review_pipeline::progress::{ProgressMode, ProgressReporter};
use lit_review_pipeline::{logging, pipeline, recovery};

/// Literature review enrichment pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/litrev.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "litrev",
    about = "Enrich bibliographic exports with DOI metadata and LLM-structured abstracts",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/litrev.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/litrev.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on an export file.
    ///
    /// Writes `final_dataset_<run_id>.csv` to the output directory and
    /// `run_metadata_<run_id>.json` plus failure logs to `<output>/logs`.
    Run(RunArgs),

    /// Retry records listed in the LLM failure log.
    ///
    /// Pass the same input file as the original run so record IDs can be
    /// re-derived. Writes `final_dataset_<stamp>_recovered.csv`.
    Recover(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Input export (.csv or .json).
    #[arg(long)]
    input: PathBuf,

    /// Override `output.dir` from the config.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override `llm.provider` (gemini or openai).
    #[arg(long, value_parser = parse_provider)]
    llm_provider: Option<Provider>,

    /// Progress output on stderr. Defaults to human on a TTY, off otherwise.
    #[arg(long, value_enum)]
    progress: Option<ProgressArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn parse_provider(value: &str) -> Result<Provider, String> {
    value.parse::<Provider>().map_err(|e| e.to_string())
}

fn prepare(base: &Config, args: &RunArgs) -> anyhow::Result<(Config, Arc<dyn ProgressReporter>)> {
    let mut cfg = base.clone();
    if let Some(dir) = &args.output_dir {
        cfg = cfg.with_output_dir(dir.clone());
    }
    if let Some(provider) = args.llm_provider {
        cfg = cfg.with_provider(provider);
    }
    cfg.ensure_directories()?;
    logging::init_logging(&cfg)?;

    let mode = args
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    Ok((cfg, Arc::from(mode.reporter())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let base = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run(args) => {
            let (cfg, progress) = prepare(&base, &args)?;
            let result = pipeline::run_pipeline(&cfg, &args.input, progress).await?;
            println!("Run ID:        {}", result.run_id);
            println!("Rows:          {}", result.rows);
            println!("Output CSV:    {}", result.output_csv.display());
            println!("Run metadata:  {}", result.run_metadata.display());
        }
        Commands::Recover(args) => {
            let (cfg, progress) = prepare(&base, &args)?;
            let input = args.input.clone();
            let report = tokio::task::spawn_blocking(move || {
                recovery::recover_failed_rows(&cfg, &input, progress.as_ref())
            })
            .await
            .context("Recovery worker panicked")??;

            let fields = serde_json::to_value(&report)?;
            if let Some(map) = fields.as_object() {
                for (key, value) in map {
                    match value {
                        serde_json::Value::String(text) => println!("{}: {}", key, text),
                        other => println!("{}: {}", key, other),
                    }
                }
            }
        }
    }

    Ok(())
}
