//! Typed view of the watched inventory table: parsing the delimited file,
//! checking it against the column contract, and the row and key types the
//! rest of the pipeline diffs and serializes.

pub mod reader;
pub mod row;
pub mod schema;

pub use reader::{read_table, RawTable, SourceTable};
pub use row::{CellValue, Row, RowKey};
pub use schema::{ColumnSpec, ColumnType, SchemaValidator, SchemaViolation, ViolationReason};
