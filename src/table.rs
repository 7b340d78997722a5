//! Tabular snapshots.
//!
//! A [`Table`] is an ordered list of column names plus string rows. Final
//! datasets are written with [`Table::write_csv`], and recovery reads the
//! latest one back with [`Table::read_csv`]. Empty cells stand for null.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;

use crate::persist;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.columns.len() {
            bail!(
                "Row has {} cells but the table has {} columns",
                row.len(),
                self.columns.len()
            );
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| r[col].as_str())
    }

    /// Set `column` to `value` on every row, appending the column if needed.
    pub fn set_column(&mut self, column: &str, value: &str) {
        match self.column_index(column) {
            Some(col) => {
                for row in &mut self.rows {
                    row[col] = value.to_string();
                }
            }
            None => {
                self.columns.push(column.to_string());
                for row in &mut self.rows {
                    row.push(value.to_string());
                }
            }
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let columns: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut table = Table::new(columns);
        for (line, record) in reader.records().enumerate() {
            let record = record
                .with_context(|| format!("Malformed row {} in {}", line + 1, path.display()))?;
            table.push_row(record.iter().map(str::to_string).collect())?;
        }
        Ok(table)
    }
}

/// Render a JSON value as a table cell.
///
/// Null becomes an empty cell, strings are kept verbatim, other scalars use
/// their JSON text, and lists or objects become compact sorted-key JSON with
/// non-ASCII characters escaped.
pub fn cell_from_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => {
            persist::to_ascii_json(value).unwrap_or_else(|_| value.to_string())
        }
    }
}

pub fn flag_cell(flag: Option<bool>) -> String {
    match flag {
        Some(true) => "1".to_string(),
        Some(false) => "0".to_string(),
        None => String::new(),
    }
}
