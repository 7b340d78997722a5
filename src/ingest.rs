//! Loading bibliographic exports.
//!
//! Accepts OpenAlex-style exports as `.csv` or `.json`. JSON input may be a
//! list of works, an object with a `results` list, or a single work. Known
//! columns map onto [`Record`] fields; every other column is kept as an
//! extra string column so it survives into the final dataset.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::models::Record;
use crate::table::cell_from_value;

/// Load every record from a CSV or JSON export.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    if !path.exists() {
        bail!("Input file does not exist: {}", path.display());
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let records = match extension.as_deref() {
        Some("csv") => load_csv(path)?,
        Some("json") => load_json(path)?,
        _ => bail!(
            "Input file must be .csv or .json: {}",
            path.display()
        ),
    };
    info!(rows = records.len(), path = %path.display(), "Loaded input records");
    Ok(records)
}

fn load_csv(path: &Path) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed to read header of {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("Malformed row {} in {}", line + 1, path.display()))?;
        let fields: Vec<(String, Value)> = headers
            .iter()
            .zip(row.iter())
            .map(|(key, value)| (key.clone(), Value::String(value.to_string())))
            .collect();
        records.push(record_from_fields(fields));
    }
    Ok(records)
}

fn load_json(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let payload: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON in {}", path.display()))?;

    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("results") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                object.insert("results".to_string(), other);
                vec![Value::Object(object)]
            }
            None => vec![Value::Object(object)],
        },
        _ => bail!("Unsupported JSON structure in {}", path.display()),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(object) => Ok(record_from_fields(object)),
            _ => bail!("Item {} in {} is not an object", index, path.display()),
        })
        .collect()
}

fn record_from_fields<I>(fields: I) -> Record
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut record = Record::default();
    let mut saw_abstract = false;
    let mut inverted_index = None;

    for (key, value) in fields {
        match key.as_str() {
            "id" => record.source_id = text_of(&value),
            "record_id" => {
                let text = text_of(&value);
                record.record_id = if text.trim().is_empty() { None } else { Some(text) };
            }
            "title" => record.title = text_of(&value),
            "abstract" => {
                saw_abstract = true;
                record.abstract_text = text_of(&value);
            }
            "abstract_inverted_index" => inverted_index = Some(value),
            "doi" => record.doi = normalize_doi(&text_of(&value)),
            "publication_year" => record.publication_year = parse_year(&value),
            "type" => record.work_type = text_of(&value),
            _ => record.extra.push((key, cell_from_value(&value))),
        }
    }

    if !saw_abstract {
        if let Some(index) = inverted_index {
            record.abstract_text = rebuild_inverted_abstract(&index);
        }
    }
    record
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Strip resolver prefixes from a DOI. Blank input yields `None`.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim();
    for prefix in ["https://doi.org/", "http://doi.org/"] {
        if let Some(rest) = strip_prefix_ignore_case(doi, prefix) {
            doi = rest;
            break;
        }
    }
    if let Some(rest) = strip_prefix_ignore_case(doi, "doi:") {
        doi = rest.trim_start();
    }
    let doi = doi.trim();
    if doi.is_empty() {
        None
    } else {
        Some(doi.to_string())
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

/// Accepts integers, integral floats (`2024.0`), and their string forms.
pub fn parse_year(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 {
        Some(value as i64)
    } else {
        None
    }
}

/// Rebuild abstract text from an OpenAlex inverted index
/// (`{"word": [positions...]}`), placing each word at its positions.
pub fn rebuild_inverted_abstract(index: &Value) -> String {
    let parsed;
    let object: &Map<String, Value> = match index {
        Value::Object(object) => object,
        Value::String(text) if !text.trim().is_empty() => {
            parsed = serde_json::from_str::<Value>(text).ok();
            match parsed.as_ref().and_then(Value::as_object) {
                Some(object) => object,
                None => return String::new(),
            }
        }
        _ => return String::new(),
    };

    let mut positions: BTreeMap<u64, &str> = BTreeMap::new();
    for (word, places) in object {
        if let Some(places) = places.as_array() {
            for place in places.iter().filter_map(Value::as_u64) {
                positions.insert(place, word.as_str());
            }
        }
    }
    positions.into_values().collect::<Vec<_>>().join(" ")
}
