//! Dataset ingestion from whitespace-delimited measurement records.
//!
//! Each record line holds one measurement in a fixed column, e.g. a weather
//! station export:
//!
//! ```text
//! CRANWELL 2016 1 1 0000 -2.4
//! ```
//!
//! Blank lines and `#` comments are skipped; any other malformed line fails
//! the whole read with its line number.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::fixed;

/// Column of the measurement in the default record layout.
pub const DEFAULT_COLUMN: usize = 5;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected a value in column {}, found {found} field(s)", .column + 1)]
    MissingField { line: usize, column: usize, found: usize },

    #[error("line {line}: '{value}' is not a finite number")]
    InvalidNumber { line: usize, value: String },

    #[error("line {line}: {value} is outside the encodable range")]
    OutOfRange { line: usize, value: f64 },

    #[error("no measurements found")]
    EmptyDataset,
}

/// Read and encode every measurement in `path`.
pub fn read_dataset(path: &Path, column: usize) -> Result<Vec<i32>, IngestError> {
    let io_error = |source: std::io::Error| IngestError::Io {
        path: path.display().to_string(),
        source,
    };
    let file = File::open(path).map_err(io_error)?;

    let mut data = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error)?;
        if let Some(value) = parse_line(&line, index + 1, column)? {
            data.push(value);
        }
    }

    if data.is_empty() {
        return Err(IngestError::EmptyDataset);
    }
    info!(path = %path.display(), count = data.len(), "dataset read");
    Ok(data)
}

/// Encode every measurement in an in-memory document.
pub fn parse_str(text: &str, column: usize) -> Result<Vec<i32>, IngestError> {
    let mut data = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(value) = parse_line(line, index + 1, column)? {
            data.push(value);
        }
    }

    if data.is_empty() {
        return Err(IngestError::EmptyDataset);
    }
    Ok(data)
}

/// Parse one record. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str, line_no: usize, column: usize) -> Result<Option<i32>, IngestError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let raw = fields.get(column).ok_or(IngestError::MissingField {
        line: line_no,
        column,
        found: fields.len(),
    })?;

    let value: f64 = raw
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| IngestError::InvalidNumber {
            line: line_no,
            value: raw.to_string(),
        })?;

    let encoded = fixed::checked_encode(value).ok_or(IngestError::OutOfRange {
        line: line_no,
        value,
    })?;
    debug!(line = line_no, value, encoded, "record parsed");
    Ok(Some(encoded))
}
