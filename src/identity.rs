//! Deterministic record identifiers.
//!
//! Every record gets a `record_id` that is stable across reruns on the same
//! ordered input and unique within a run. The base identifier comes from the
//! first available of:
//!
//! 1. an explicit `record_id` column, sanitized,
//! 2. the source `id`, sanitized,
//! 3. `record_` + the first 16 hex characters of
//!    SHA-256(`title|year|type|index`).
//!
//! Bases that occur more than once receive `__1`, `__2`, ... suffixes in
//! first-seen order.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::models::Record;

/// Replace runs of characters outside `[A-Za-z0-9_.-]` with `_` and trim
/// leading and trailing underscores.
pub fn sanitize_record_id(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_run = false;
    for ch in value.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out.trim_matches('_').to_string()
}

fn fingerprint(record: &Record, index: usize) -> String {
    let material = format!(
        "{}|{}|{}|{}",
        record.title,
        record.year_text(),
        record.work_type,
        index
    );
    let digest = Sha256::digest(material.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("record_{}", &hex[..16])
}

/// Base identifier for the record at position `index`, before collision handling.
pub fn base_record_id(record: &Record, index: usize) -> String {
    let candidates = [record.record_id.as_deref(), Some(record.source_id.as_str())];
    for candidate in candidates.into_iter().flatten() {
        let sanitized = sanitize_record_id(candidate);
        if !sanitized.is_empty() {
            return sanitized;
        }
    }
    fingerprint(record, index)
}

/// One unique identifier per record, parallel to `records`.
pub fn assign_record_ids(records: &[Record]) -> Vec<String> {
    let bases: Vec<String> = records
        .iter()
        .enumerate()
        .map(|(index, record)| base_record_id(record, index))
        .collect();

    let mut totals: HashMap<&str, usize> = HashMap::new();
    for base in &bases {
        *totals.entry(base.as_str()).or_insert(0) += 1;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    bases
        .iter()
        .map(|base| {
            if totals[base.as_str()] == 1 {
                return base.clone();
            }
            let n = seen.entry(base.as_str()).or_insert(0);
            *n += 1;
            format!("{}__{}", base, n)
        })
        .collect()
}

/// Assign identifiers and store them on the records.
pub fn attach_record_ids(mut records: Vec<Record>) -> Vec<Record> {
    let ids = assign_record_ids(&records);
    for (record, id) in records.iter_mut().zip(ids) {
        record.record_id = Some(id);
    }
    records
}
