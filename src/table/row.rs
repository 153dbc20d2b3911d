use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};

/// Relative tolerance used when comparing float cells.
pub const FLOAT_RELATIVE_TOLERANCE: f64 = 1e-9;

/// A typed table cell.
#[derive(Debug, Clone)]
pub enum CellValue {
    Date(NaiveDate),
    Text(String),
    Integer(i64),
    Float(f64),
}

impl CellValue {
    /// Field equality as the diff sees it: exact for dates, strings and
    /// integers, relative-epsilon for floats.
    pub fn same_as(&self, other: &CellValue) -> bool {
        match (self, other) {
            (CellValue::Date(a), CellValue::Date(b)) => a == b,
            (CellValue::Text(a), CellValue::Text(b)) => a == b,
            (CellValue::Integer(a), CellValue::Integer(b)) => a == b,
            (CellValue::Float(a), CellValue::Float(b)) => floats_close(*a, *b),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

fn floats_close(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= FLOAT_RELATIVE_TOLERANCE * scale
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            CellValue::Text(s) => serializer.serialize_str(s),
            CellValue::Integer(v) => serializer.serialize_i64(*v),
            CellValue::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

/// Composite natural key of an inventory row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub store_id: String,
    pub product_id: String,
    pub date: NaiveDate,
}

impl RowKey {
    pub fn new(store_id: impl Into<String>, product_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            store_id: store_id.into(),
            product_id: product_id.into(),
            date,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.store_id, self.product_id, self.date)
    }
}

/// One validated row: column name to typed value, plus its composite key.
///
/// Serializes as a flat JSON object of its cells.
#[derive(Debug, Clone)]
pub struct Row {
    key: RowKey,
    values: BTreeMap<Arc<str>, CellValue>,
}

impl Row {
    pub(crate) fn new(key: RowKey, values: BTreeMap<Arc<str>, CellValue>) -> Self {
        Self { key, values }
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|c| c.as_ref())
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.values.iter().map(|(c, v)| (c.as_ref(), v))
    }

    /// Columns whose values differ between `self` and `other`, in column order.
    /// A column present on only one side counts as differing.
    pub fn changed_columns(&self, other: &Row) -> Vec<String> {
        let mut changed: Vec<String> = self
            .values
            .iter()
            .filter(|(column, value)| {
                other
                    .values
                    .get(column.as_ref())
                    .map_or(true, |theirs| !value.same_as(theirs))
            })
            .map(|(column, _)| column.to_string())
            .collect();

        changed.extend(
            other
                .values
                .keys()
                .filter(|column| !self.values.contains_key(column.as_ref()))
                .map(|column| column.to_string()),
        );
        changed.sort();
        changed
    }

    pub fn same_as(&self, other: &Row) -> bool {
        self.values.len() == other.values.len()
            && self.values.iter().all(|(column, value)| {
                other
                    .values
                    .get(column.as_ref())
                    .is_some_and(|theirs| value.same_as(theirs))
            })
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.values.iter().map(|(c, v)| (c.as_ref(), v)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a row from (column, value) pairs; key columns must be present.
    pub fn row(cells: &[(&str, CellValue)]) -> Row {
        let values: BTreeMap<Arc<str>, CellValue> = cells
            .iter()
            .map(|(c, v)| (Arc::<str>::from(*c), v.clone()))
            .collect();
        let text = |c: &str| match values.get(c) {
            Some(CellValue::Text(s)) => s.clone(),
            other => panic!("missing text column {c}: {other:?}"),
        };
        let date = values
            .get("Date")
            .and_then(CellValue::as_date)
            .expect("Date column");
        Row::new(RowKey::new(text("Store ID"), text("Product ID"), date), values)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::row;
    use super::*;

    fn date(s: &str) -> CellValue {
        CellValue::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn sample(price: f64) -> Row {
        row(&[
            ("Date", date("2024-01-01")),
            ("Store ID", CellValue::Text("S001".into())),
            ("Product ID", CellValue::Text("P0001".into())),
            ("Price", CellValue::Float(price)),
        ])
    }

    #[test]
    fn float_equality_tolerates_rounding() {
        assert!(CellValue::Float(33.5).same_as(&CellValue::Float(33.5 + 1e-12)));
        assert!(!CellValue::Float(33.5).same_as(&CellValue::Float(33.51)));
        assert!(CellValue::Float(0.0).same_as(&CellValue::Float(0.0)));
    }

    #[test]
    fn mixed_types_never_match() {
        assert!(!CellValue::Integer(1).same_as(&CellValue::Float(1.0)));
    }

    #[test]
    fn changed_columns_lists_only_differences() {
        let a = sample(10.0);
        let b = sample(12.5);
        assert_eq!(a.changed_columns(&b), vec!["Price".to_string()]);
        assert!(a.same_as(&sample(10.0)));
    }

    #[test]
    fn row_serializes_as_flat_object() {
        let json = serde_json::to_value(sample(9.5)).unwrap();
        assert_eq!(json["Date"], "2024-01-01");
        assert_eq!(json["Store ID"], "S001");
        assert_eq!(json["Price"], 9.5);
    }

    #[test]
    fn key_orders_by_store_then_product_then_date() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let a = RowKey::new("S001", "P0002", d);
        let b = RowKey::new("S002", "P0001", d);
        assert!(a < b);
        assert_eq!(a.to_string(), "S001/P0002/2024-01-01");
    }
}
