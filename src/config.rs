//! Pipeline configuration.
//!
//! A single TOML file controls the output layout, the metadata registry
//! client, and the LLM extraction backends. Every field has a default, so a
//! missing file (or a partial one) yields a usable [`Config`].
//!
//! Configuration values are immutable once loaded. CLI overrides and the
//! forced-overwrite mode used by recovery build a modified copy through the
//! `with_*` methods instead of mutating shared state.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

fn default_seed() -> u64 {
    42
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
            registry: RegistryConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Settings for the DOI metadata registry (Crossref by default).
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,
    /// Maximum number of requests in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
    /// Total attempts per key, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_registry_url() -> String {
    "https://api.crossref.org/works".to_string()
}
fn default_concurrency() -> usize {
    20
}
fn default_registry_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay() -> f64 {
    1.5
}
fn default_user_agent() -> String {
    "automated-literature-review/0.1 (research-automation)".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            concurrency: default_concurrency(),
            timeout_secs: default_registry_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            user_agent: default_user_agent(),
        }
    }
}

/// Supported LLM backends. Names are case-insensitive in the config file
/// and on the command line alike.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum Provider {
    Gemini,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::OpenAi => "openai",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::OpenAi),
            other => bail!(
                "Unknown LLM provider: '{}'. Must be gemini or openai.",
                other
            ),
        }
    }
}

impl TryFrom<String> for Provider {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: PathBuf,
    /// Ignore cached responses and call the backend for every record.
    #[serde(default)]
    pub overwrite_existing_responses: bool,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
}

fn default_provider() -> Provider {
    Provider::Gemini
}
fn default_max_workers() -> usize {
    8
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_prompt_template() -> PathBuf {
    PathBuf::from("prompts/abstract_structuring_prompt.txt")
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            max_workers: default_max_workers(),
            timeout_secs: default_llm_timeout(),
            temperature: 0.0,
            prompt_template: default_prompt_template(),
            overwrite_existing_responses: false,
            gemini: GeminiConfig::default(),
            openai: OpenAiConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_key_env")]
    pub api_key_env: String,
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_gemini_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: default_gemini_model(),
            base_url: default_gemini_url(),
            api_key_env: default_gemini_key_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            model: default_openai_model(),
            base_url: default_openai_url(),
            api_key_env: default_openai_key_env(),
        }
    }
}

impl LlmConfig {
    /// Model name of the selected provider.
    pub fn model(&self) -> &str {
        match self.provider {
            Provider::Gemini => &self.gemini.model,
            Provider::OpenAi => &self.openai.model,
        }
    }

    /// Name of the environment variable holding the selected provider's key.
    pub fn api_key_env(&self) -> &str {
        match self.provider {
            Provider::Gemini => &self.gemini.api_key_env,
            Provider::OpenAi => &self.openai.api_key_env,
        }
    }

    /// Read the API key for the selected provider from the environment.
    pub fn api_key(&self) -> Result<String> {
        let var = self.api_key_env();
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => bail!("{} is required when llm.provider = {}", var, self.provider),
        }
    }
}

impl Config {
    pub fn logs_dir(&self) -> PathBuf {
        self.output.dir.join("logs")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.output.dir.join("llm_responses")
    }

    pub fn failed_doi_log_path(&self) -> PathBuf {
        self.logs_dir().join("failed_doi_log.json")
    }

    pub fn failed_llm_log_path(&self) -> PathBuf {
        self.logs_dir().join("failed_llm_log.json")
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.logs_dir().join("pipeline.log")
    }

    /// Create the output, log, and response cache directories.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.output.dir.clone(), self.logs_dir(), self.responses_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output.dir = dir.into();
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.llm.provider = provider;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.llm.overwrite_existing_responses = overwrite;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.concurrency == 0 {
            bail!("registry.concurrency must be > 0");
        }
        if self.registry.max_retries == 0 {
            bail!("registry.max_retries must be > 0");
        }
        if self.registry.timeout_secs == 0 {
            bail!("registry.timeout_secs must be > 0");
        }
        if !(self.registry.retry_base_delay_secs >= 0.0
            && self.registry.retry_base_delay_secs.is_finite())
        {
            bail!("registry.retry_base_delay_secs must be >= 0");
        }
        if self.registry.base_url.trim().is_empty() {
            bail!("registry.base_url must not be empty");
        }
        if self.llm.max_workers == 0 {
            bail!("llm.max_workers must be > 0");
        }
        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be > 0");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if self.llm.model().trim().is_empty() {
            bail!("llm.{}.model must not be empty", self.llm.provider);
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load the config at `path`, or fall back to defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}
