//! Column contract for the inventory table.
//!
//! [`SchemaValidator::validate`] is a pure function of the raw table: it
//! either returns the typed rows or every contract violation it found, in a
//! stable order (missing columns, then bad values, then duplicate keys).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use super::reader::RawTable;
use super::row::{CellValue, Row, RowKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Date,
    String,
    Integer,
    Float,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Date => "date",
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> ColumnSpec {
    ColumnSpec { name, ty }
}

pub const STORE_ID: &str = "Store ID";
pub const PRODUCT_ID: &str = "Product ID";
pub const DATE: &str = "Date";

/// Required columns, in the order violations are reported.
pub const INVENTORY_COLUMNS: [ColumnSpec; 15] = [
    col(DATE, ColumnType::Date),
    col(STORE_ID, ColumnType::String),
    col(PRODUCT_ID, ColumnType::String),
    col("Category", ColumnType::String),
    col("Region", ColumnType::String),
    col("Inventory Level", ColumnType::Integer),
    col("Units Sold", ColumnType::Integer),
    col("Units Ordered", ColumnType::Integer),
    col("Demand Forecast", ColumnType::Float),
    col("Price", ColumnType::Float),
    col("Discount", ColumnType::Float),
    col("Weather Condition", ColumnType::String),
    col("Holiday/Promotion", ColumnType::Integer),
    col("Competitor Pricing", ColumnType::Float),
    col("Seasonality", ColumnType::String),
];

/// Why a column failed the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationReason {
    Missing,
    /// `row` is the 1-based data row of the first bad cell.
    InvalidValue {
        row: usize,
        value: String,
        detail: &'static str,
        invalid_cells: usize,
    },
    DuplicateKey {
        row: usize,
        first_row: usize,
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    pub column: String,
    /// `None` for violations that span several columns (duplicate keys).
    pub expected_type: Option<ColumnType>,
    pub reason: ViolationReason,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            ViolationReason::Missing => write!(f, "missing column '{}'", self.column),
            ViolationReason::InvalidValue {
                row,
                value,
                detail,
                invalid_cells,
            } => write!(
                f,
                "column '{}' row {row}: {value:?} is {detail} ({invalid_cells} invalid cells)",
                self.column
            ),
            ViolationReason::DuplicateKey {
                row,
                first_row,
                key,
            } => write!(f, "duplicate key {key} at row {row} (first seen at row {first_row})"),
        }
    }
}

/// Checks a raw table against the fixed inventory column contract.
#[derive(Debug, Clone, Copy)]
pub struct SchemaValidator {
    contract: &'static [ColumnSpec],
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self {
            contract: &INVENTORY_COLUMNS,
        }
    }
}

#[derive(Default)]
struct BadCells {
    first: Option<(usize, String, &'static str)>,
    count: usize,
}

impl SchemaValidator {
    pub fn contract(&self) -> &'static [ColumnSpec] {
        self.contract
    }

    /// Validate `table` and convert it into typed rows.
    ///
    /// Extra columns are allowed and carried as strings. A table with the
    /// right headers and no rows is valid.
    pub fn validate(&self, table: &RawTable) -> Result<Vec<Row>, Vec<SchemaViolation>> {
        let mut positions: AHashMap<&str, usize> = AHashMap::with_capacity(table.headers.len());
        for (idx, header) in table.headers.iter().enumerate() {
            positions.entry(header.as_str()).or_insert(idx);
        }

        let mut violations: Vec<SchemaViolation> = self
            .contract
            .iter()
            .filter(|spec| !positions.contains_key(spec.name))
            .map(|spec| SchemaViolation {
                column: spec.name.to_string(),
                expected_type: Some(spec.ty),
                reason: ViolationReason::Missing,
            })
            .collect();

        let required: Vec<(usize, Arc<str>, ColumnType)> = self
            .contract
            .iter()
            .filter_map(|spec| {
                positions
                    .get(spec.name)
                    .map(|&idx| (idx, Arc::<str>::from(spec.name), spec.ty))
            })
            .collect();

        let extras: Vec<(usize, Arc<str>)> = table
            .headers
            .iter()
            .enumerate()
            .filter(|(idx, header)| {
                positions.get(header.as_str()) == Some(idx)
                    && !self.contract.iter().any(|spec| spec.name == header.as_str())
            })
            .map(|(idx, header)| (idx, Arc::<str>::from(header.as_str())))
            .collect();

        let mut bad: Vec<BadCells> = required.iter().map(|_| BadCells::default()).collect();
        let mut rows = Vec::with_capacity(table.records.len());

        for (row_idx, record) in table.records.iter().enumerate() {
            let mut values = BTreeMap::new();
            let mut row_ok = true;

            for (slot, (idx, name, ty)) in required.iter().enumerate() {
                let raw = record.get(*idx).unwrap_or("");
                match parse_cell(*ty, raw) {
                    Ok(value) => {
                        values.insert(name.clone(), value);
                    }
                    Err(detail) => {
                        row_ok = false;
                        let cells = &mut bad[slot];
                        cells.count += 1;
                        if cells.first.is_none() {
                            cells.first = Some((row_idx + 1, raw.to_string(), detail));
                        }
                    }
                }
            }

            if !row_ok || !violations.is_empty() {
                continue;
            }

            for (idx, name) in &extras {
                let raw = record.get(*idx).unwrap_or("");
                values.insert(name.clone(), CellValue::Text(raw.to_string()));
            }

            if let Some(key) = key_of(&values) {
                rows.push(Row::new(key, values));
            }
        }

        for ((_, name, ty), cells) in required.iter().zip(bad) {
            if let Some((row, value, detail)) = cells.first {
                violations.push(SchemaViolation {
                    column: name.to_string(),
                    expected_type: Some(*ty),
                    reason: ViolationReason::InvalidValue {
                        row,
                        value,
                        detail,
                        invalid_cells: cells.count,
                    },
                });
            }
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        if let Some(duplicate) = find_duplicate(&rows) {
            return Err(vec![duplicate]);
        }

        Ok(rows)
    }
}

fn find_duplicate(rows: &[Row]) -> Option<SchemaViolation> {
    let mut seen: AHashMap<&RowKey, usize> = AHashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        if let Some(&first) = seen.get(row.key()) {
            return Some(SchemaViolation {
                column: format!("{STORE_ID}+{PRODUCT_ID}+{DATE}"),
                expected_type: None,
                reason: ViolationReason::DuplicateKey {
                    row: idx + 1,
                    first_row: first,
                    key: row.key().to_string(),
                },
            });
        }
        seen.insert(row.key(), idx + 1);
    }
    None
}

fn key_of(values: &BTreeMap<Arc<str>, CellValue>) -> Option<RowKey> {
    match (values.get(STORE_ID), values.get(PRODUCT_ID), values.get(DATE)) {
        (Some(CellValue::Text(store)), Some(CellValue::Text(product)), Some(CellValue::Date(date))) => {
            Some(RowKey::new(store.clone(), product.clone(), *date))
        }
        _ => None,
    }
}

pub(crate) fn parse_cell(ty: ColumnType, raw: &str) -> Result<CellValue, &'static str> {
    let s = raw.trim();
    if ty != ColumnType::String && s.is_empty() {
        return Err("an empty value");
    }

    match ty {
        ColumnType::String => Ok(CellValue::Text(s.to_string())),
        ColumnType::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date()))
            .map(CellValue::Date)
            .map_err(|_| "not a YYYY-MM-DD date"),
        ColumnType::Integer => {
            if let Ok(v) = s.parse::<i64>() {
                return Ok(CellValue::Integer(v));
            }
            match s.parse::<f64>() {
                Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(CellValue::Integer(f as i64))
                }
                _ => Err("not an integer"),
            }
        }
        ColumnType::Float => match s.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(CellValue::Float(f)),
            Ok(_) => Err("not a finite number"),
            Err(_) => Err("not a number"),
        },
    }
}
