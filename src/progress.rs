//! Pipeline progress reporting.
//!
//! Reports observable progress while records are ingested, resolved against
//! the registry, and sent through LLM extraction, so users see how much is
//! left. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts. Reporters are called from the coordinating task or thread once
//! per completed unit, in completion order.

use std::fmt;
use std::io::Write;

/// Pipeline stage a progress event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Ingestion,
    Preprocess,
    Doi,
    Llm,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::Preprocess => "preprocess",
            Stage::Doi => "doi",
            Stage::Llm => "llm",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `completed` out of `total` units of `stage` are done.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub completed: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(stage: Stage, completed: u64, total: u64) -> Self {
        Self {
            stage,
            completed,
            total,
        }
    }
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "llm  1,234 / 5,000".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!(
            "{:<10}  {} / {}\n",
            event.stage.as_str(),
            format_number(event.completed),
            format_number(event.total)
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "stage": event.stage.as_str(),
            "completed": event.completed,
            "total": event.total,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn stage_names() {
        let names: Vec<&str> = [Stage::Ingestion, Stage::Preprocess, Stage::Doi, Stage::Llm]
            .iter()
            .map(Stage::as_str)
            .collect();
        assert_eq!(names, vec!["ingestion", "preprocess", "doi", "llm"]);
    }
}
