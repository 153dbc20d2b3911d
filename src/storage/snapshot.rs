use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::table::{schema::DATE, Row};

/// One committed, fully validated version of the table.
///
/// Snapshots are shared as `Arc<Snapshot>` and never mutated after
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    sequence: u64,
    captured_at: DateTime<Utc>,
    source_modified: Option<DateTime<Utc>>,
    row_count: usize,
    columns: Vec<String>,
    rows: Vec<Arc<Row>>,
}

impl Snapshot {
    pub fn new(
        sequence: u64,
        columns: Vec<String>,
        rows: Vec<Row>,
        source_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            sequence,
            captured_at: Utc::now(),
            source_modified,
            row_count: rows.len(),
            columns,
            rows: rows.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn source_modified(&self) -> Option<DateTime<Utc>> {
        self.source_modified
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Arc<Row>] {
        &self.rows
    }

    pub fn summary(&self) -> SnapshotSummary {
        let mut numeric: BTreeMap<String, NumericSummary> = BTreeMap::new();
        let mut range: Option<DateRange> = None;

        for row in &self.rows {
            for (column, value) in row.cells() {
                if let Some(v) = value.as_f64() {
                    numeric
                        .entry(column.to_string())
                        .and_modify(|s| s.observe(v))
                        .or_insert_with(|| NumericSummary::first(v));
                }
            }
            if let Some(date) = row.get(DATE).and_then(|d| d.as_date()) {
                range = Some(match range {
                    None => DateRange {
                        start: date,
                        end: date,
                    },
                    Some(r) => DateRange {
                        start: r.start.min(date),
                        end: r.end.max(date),
                    },
                });
            }
        }

        SnapshotSummary {
            sequence: self.sequence,
            captured_at: self.captured_at,
            total_rows: self.row_count,
            columns: self.columns.clone(),
            date_range: range,
            numeric,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NumericSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl NumericSummary {
    fn first(v: f64) -> Self {
        Self {
            count: 1,
            min: v,
            max: v,
            mean: v,
        }
    }

    fn observe(&mut self, v: f64) {
        self.count += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.mean += (v - self.mean) / self.count as f64;
    }
}

/// Aggregate view of a snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub total_rows: usize,
    pub columns: Vec<String>,
    pub date_range: Option<DateRange>,
    pub numeric: BTreeMap<String, NumericSummary>,
}
