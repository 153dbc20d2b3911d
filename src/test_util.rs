//! Fixture builders for unit tests.

use std::path::Path;

pub const HEADER: &str = "Date,Store ID,Product ID,Category,Region,Inventory Level,Units Sold,Units Ordered,Demand Forecast,Price,Discount,Weather Condition,Holiday/Promotion,Competitor Pricing,Seasonality";

pub fn inventory_line(store: &str, product: &str, units_sold: i64, price: f64) -> String {
    format!(
        "2024-01-01,{store},{product},Groceries,North,120,{units_sold},50,110.5,{price},10,Sunny,0,31.2,Winter"
    )
}

/// A full file with one `S001` row per `(product, units_sold, price)`.
pub fn inventory_csv(rows: &[(&str, i64, f64)]) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    for (product, units_sold, price) in rows {
        out.push_str(&inventory_line("S001", product, *units_sold, *price));
        out.push('\n');
    }
    out
}

pub fn write_file(path: &Path, contents: &str) {
    std::fs::write(path, contents).expect("write fixture");
}
