//! # Literature Review Pipeline
//!
//! Enrichment core for automated literature reviews over bibliographic
//! exports (OpenAlex-style CSV or JSON).
//!
//! Each record is cleaned, given a stable `record_id`, enriched with DOI
//! metadata from a Crossref-style registry, and run through an LLM that
//! turns its abstract into a fixed set of structured fields. The merged
//! result is written as a timestamped CSV snapshot with run provenance.
//! Records whose extraction failed can be retried later with
//! [`recovery::recover_failed_rows`], which patches a new snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────┐
//! │  ingest  │──▶│ preprocess │──▶│ identity │──▶│  resolver   │──▶│extractor │
//! │ CSV/JSON │   │ clean+sort │   │record_id │   │ async HTTP  │   │ pool+LLM │
//! └──────────┘   └────────────┘   └──────────┘   └─────────────┘   └────┬─────┘
//!                                                                       │
//!                        ┌──────────────────────────────────────────────┤
//!                        ▼                                              ▼
//!              ┌───────────────────┐                          ┌──────────────────┐
//!              │ final_dataset_*.csv│◀──── recovery ───────────│ failed_llm_log   │
//!              └───────────────────┘                          └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export GEMINI_API_KEY=...
//! litrev run --input works.json              # full pipeline
//! litrev recover --input works.json          # retry failed extractions
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`schema`] | Structured field set and defaults |
//! | [`ingest`] | CSV/JSON export loading |
//! | [`preprocess`] | Text normalization and filtering |
//! | [`identity`] | Deterministic record IDs |
//! | [`fanout`] | Order-preserving bounded fan-out |
//! | [`resolver`] | DOI metadata resolution |
//! | [`client`] | LLM backend abstraction |
//! | [`extractor`] | Abstract structuring with response cache |
//! | [`recovery`] | Retry failed rows and patch snapshots |
//! | [`table`] | CSV snapshots |
//! | [`persist`] | ASCII-escaped JSON artifacts |
//! | [`pipeline`] | End-to-end orchestration |
//! | [`progress`] | Progress reporting |
//! | [`logging`] | Tracing subscriber setup |

pub mod client;
pub mod config;
pub mod extractor;
pub mod fanout;
pub mod identity;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod persist;
pub mod pipeline;
pub mod preprocess;
pub mod progress;
pub mod recovery;
pub mod resolver;
pub mod schema;
pub mod table;
