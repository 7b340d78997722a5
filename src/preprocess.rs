//! Record cleaning and heuristic flags.

use std::cmp::Ordering;
use tracing::info;
use unicode_normalization::UnicodeNormalization;

use crate::models::Record;

pub const MANUFACTURING_KEYWORDS: [&str; 10] = [
    "manufacturing",
    "factory",
    "production line",
    "industrial",
    "supply chain",
    "assembly",
    "shop floor",
    "predictive maintenance",
    "quality control",
    "process optimization",
];

/// NFKC-normalize, then trim and collapse internal whitespace runs to a
/// single space.
pub fn normalize_text(value: &str) -> String {
    let composed: String = value.nfkc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn has_manufacturing_context(title: &str, abstract_text: &str) -> bool {
    let combined = format!("{} {}", title, abstract_text).to_lowercase();
    MANUFACTURING_KEYWORDS
        .iter()
        .any(|keyword| combined.contains(keyword))
}

fn cmp_year(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Normalize text fields, drop records without an abstract, set the
/// `has_abstract` and `manufacturing_context` flags, and sort by
/// (`id`, `publication_year` with missing years last, `title`).
///
/// The sort is stable, so ties keep their input order.
pub fn preprocess_records(records: Vec<Record>) -> Vec<Record> {
    let before = records.len();
    let mut kept: Vec<Record> = records
        .into_iter()
        .filter_map(|mut record| {
            record.source_id = normalize_text(&record.source_id);
            record.title = normalize_text(&record.title);
            record.abstract_text = normalize_text(&record.abstract_text);
            record.work_type = normalize_text(&record.work_type);
            if record.abstract_text.is_empty() {
                return None;
            }
            record.has_abstract = Some(true);
            record.manufacturing_context = Some(has_manufacturing_context(
                &record.title,
                &record.abstract_text,
            ));
            Some(record)
        })
        .collect();

    kept.sort_by(|a, b| {
        a.source_id
            .cmp(&b.source_id)
            .then_with(|| cmp_year(a.publication_year, b.publication_year))
            .then_with(|| a.title.cmp(&b.title))
    });

    info!(
        before,
        after = kept.len(),
        dropped = before - kept.len(),
        "Preprocessed records"
    );
    kept
}
