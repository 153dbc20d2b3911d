use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::ReadError;

/// A parsed but not yet validated delimited file.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    /// Trimmed header names, in file order.
    pub headers: Vec<String>,
    pub records: Vec<csv::StringRecord>,
}

impl RawTable {
    pub fn parse(bytes: &[u8], delimiter: u8) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(bytes);

        let headers = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let records = reader.records().collect::<Result<Vec<_>, _>>()?;

        Ok(Self { headers, records })
    }
}

/// The file contents plus what the filesystem said about it.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub path: PathBuf,
    pub table: RawTable,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

fn fingerprint(path: &Path) -> Result<Fingerprint, ReadError> {
    let meta = fs::metadata(path).map_err(|source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Fingerprint {
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Read and parse the file at `path`. Blocking; run it off the async runtime.
///
/// The file is stat'ed before and after the read so a writer racing with us
/// surfaces as [`ReadError::ChangedDuringRead`] instead of a half-written table.
pub fn read_table(path: &Path, delimiter: u8) -> Result<SourceTable, ReadError> {
    let before = fingerprint(path)?;

    let bytes = fs::read(path).map_err(|source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if bytes.is_empty() {
        return Err(ReadError::Empty {
            path: path.to_path_buf(),
        });
    }

    let after = fingerprint(path)?;
    if before != after || after.len != bytes.len() as u64 {
        return Err(ReadError::ChangedDuringRead {
            path: path.to_path_buf(),
        });
    }

    let table = RawTable::parse(&bytes, delimiter).map_err(|source| ReadError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(SourceTable {
        path: path.to_path_buf(),
        table,
        modified: after.modified.map(DateTime::<Utc>::from),
    })
}
