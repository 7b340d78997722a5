#![allow(dead_code)]

use anyhow::{bail, Result};
use axum::Router;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use lit_review_pipeline::client::ExtractionClient;
use lit_review_pipeline::config::Config;

/// Serve `app` on 127.0.0.1:<free port> from a dedicated thread and runtime,
/// so both async and blocking clients can reach it. Returns the base URL.
pub fn spawn_server(app: Router) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    format!("http://{}", addr)
}

/// Config rooted in a scratch directory with a fast-failing registry.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default().with_output_dir(tmp.path().join("output"));
    config.registry.retry_base_delay_secs = 0.0;
    config.registry.timeout_secs = 2;
    config.registry.max_retries = 2;
    config.llm.max_workers = 3;
    config.llm.prompt_template = write_template(tmp.path());
    config
}

pub fn write_template(dir: &Path) -> PathBuf {
    let path = dir.join("prompt.txt");
    std::fs::write(
        &path,
        "TITLE={title}\nYEAR={publication_year}\nTYPE={publication_type}\nABSTRACT={abstract}\n",
    )
    .unwrap();
    path
}

/// Write a JSON export of `(id, title, abstract, doi)` works.
pub fn write_input(dir: &Path, works: &[(&str, &str, &str, &str)]) -> PathBuf {
    let results: Vec<Value> = works
        .iter()
        .map(|(id, title, abstract_text, doi)| {
            json!({
                "id": id,
                "title": title,
                "abstract": abstract_text,
                "doi": doi,
                "publication_year": 2023,
                "type": "article",
            })
        })
        .collect();
    let path = dir.join("works.json");
    std::fs::write(&path, json!({"results": results}).to_string()).unwrap();
    path
}

type Responder = dyn Fn(&str) -> Result<String> + Send + Sync;

/// In-memory backend that answers from a closure and counts calls.
pub struct ScriptedClient {
    calls: AtomicUsize,
    respond: Box<Responder>,
}

impl ScriptedClient {
    pub fn new(respond: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            respond: Box::new(respond),
        })
    }

    /// Answers every prompt with a category derived from the title line.
    pub fn echo() -> Arc<Self> {
        Self::new(|prompt| Ok(answer_for(prompt)))
    }

    /// Fails every prompt whose title contains `marker`.
    pub fn failing_on(marker: &'static str) -> Arc<Self> {
        Self::new(move |prompt| {
            if title_of(prompt).contains(marker) {
                bail!("backend unavailable");
            }
            Ok(answer_for(prompt))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ExtractionClient for ScriptedClient {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(prompt)
    }
}

pub fn title_of(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("TITLE="))
        .unwrap_or("")
        .to_string()
}

pub fn answer_for(prompt: &str) -> String {
    format!(
        "```json\n{}\n```",
        json!({
            "ai_category": format!("category for {}", title_of(prompt)),
            "kpis": ["oee"],
            "confidence_score": 0.9,
        })
    )
}
