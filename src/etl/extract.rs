//! Source file reader.
//!
//! The header is checked against the fixed source schema as soon as the file
//! is opened; rows are then produced lazily in file order. Opening the same
//! source again restarts the sequence from the first row.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::record::SOURCE_COLUMNS;
use crate::domain::RawRecord;

/// Errors that stop extraction entirely
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Schema mismatch in {path}: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        path: PathBuf,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
}

/// Opens a delimited source file as a sequence of [`RawRecord`]s
#[derive(Debug, Clone)]
pub struct Extractor {
    path: PathBuf,
    delimiter: u8,
}

impl Extractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the source and validate its header.
    ///
    /// The file handle lives inside the returned reader and is closed when
    /// the reader is dropped, whether iteration finished or not.
    pub fn open(&self) -> Result<RecordReader, ExtractError> {
        let file = File::open(&self.path).map_err(|e| self.unavailable(e))?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers = reader.headers().map_err(|e| self.unavailable(e))?.clone();
        let positions = self.column_positions(&headers)?;

        Ok(RecordReader {
            path: self.path.clone(),
            records: reader.into_records(),
            positions,
            line: 0,
        })
    }

    /// Read every row into memory
    pub fn read_all(&self) -> Result<Vec<RawRecord>, ExtractError> {
        self.open()?.collect()
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> ExtractError {
        ExtractError::SourceUnavailable {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }

    /// Map each schema column to its index in the file.
    ///
    /// Order does not matter; names must match exactly and appear once.
    fn column_positions(&self, headers: &csv::StringRecord) -> Result<[usize; 8], ExtractError> {
        let names: Vec<&str> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| if i == 0 { h.trim_start_matches('\u{feff}') } else { h })
            .collect();

        let expected: HashSet<&str> = SOURCE_COLUMNS.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut unexpected: Vec<String> = Vec::new();
        for name in &names {
            if !expected.contains(name) || !seen.insert(*name) {
                unexpected.push(name.to_string());
            }
        }
        let missing: Vec<String> = SOURCE_COLUMNS
            .iter()
            .filter(|c| !seen.contains(*c))
            .map(|c| c.to_string())
            .collect();

        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ExtractError::SchemaMismatch {
                path: self.path.clone(),
                missing,
                unexpected,
            });
        }

        let mut positions = [0usize; 8];
        for (slot, column) in positions.iter_mut().zip(SOURCE_COLUMNS.iter()) {
            // Presence was checked above
            *slot = names.iter().position(|n| n == column).unwrap_or_default();
        }
        Ok(positions)
    }
}

/// Lazy iterator over the rows of an opened source
pub struct RecordReader {
    path: PathBuf,
    records: csv::StringRecordsIntoIter<BufReader<File>>,
    positions: [usize; 8],
    line: u64,
}

impl RecordReader {
    fn field(&self, row: &csv::StringRecord, column: usize) -> String {
        row.get(self.positions[column]).unwrap_or("").to_string()
    }
}

impl Iterator for RecordReader {
    type Item = Result<RawRecord, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.records.next()? {
            Ok(row) => row,
            Err(e) => {
                return Some(Err(ExtractError::SourceUnavailable {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }))
            }
        };
        self.line += 1;

        // Short rows yield empty fields, which the transformer rejects
        Some(Ok(RawRecord {
            line: self.line,
            list_year: self.field(&row, 0),
            town: self.field(&row, 1),
            address: self.field(&row, 2),
            assessed_value: self.field(&row, 3),
            sale_amount: self.field(&row, 4),
            sales_ratio: self.field(&row, 5),
            property_type: self.field(&row, 6),
            residential_type: self.field(&row, 7),
        }))
    }
}
