//! Sale records as read from the source file and as loaded into the warehouse.
//!
//! The source schema is fixed. Column lookup happens once, at the extractor
//! boundary, so the rest of the pipeline works with plain structs instead of
//! loosely-typed rows.

use serde::{Deserialize, Serialize};

/// Source column names, in the order they appear in the published dataset.
pub const SOURCE_COLUMNS: [&str; 8] = [
    "List Year",
    "Town",
    "Address",
    "Assessed Value",
    "Sale Amount",
    "Sales Ratio",
    "Property Type",
    "Residential Type",
];

/// Warehouse column names, in table order.
pub const WAREHOUSE_COLUMNS: [&str; 8] = [
    "SaleID",
    "ListYear",
    "Town",
    "Address",
    "AssessedValue",
    "SaleAmount",
    "SalesRatio",
    "PropertyType",
];

/// A row exactly as it was read from the source, all fields string-typed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    /// 1-based data line number in the source (header excluded)
    pub line: u64,
    pub list_year: String,
    pub town: String,
    pub address: String,
    pub assessed_value: String,
    pub sale_amount: String,
    pub sales_ratio: String,
    pub property_type: String,
    pub residential_type: String,
}

impl RawRecord {
    /// Fields that survive normalization, paired with their source column name.
    ///
    /// `Residential Type` is intentionally absent.
    pub fn retained_fields(&self) -> [(&'static str, &str); 7] {
        [
            ("List Year", self.list_year.as_str()),
            ("Town", self.town.as_str()),
            ("Address", self.address.as_str()),
            ("Assessed Value", self.assessed_value.as_str()),
            ("Sale Amount", self.sale_amount.as_str()),
            ("Sales Ratio", self.sales_ratio.as_str()),
            ("Property Type", self.property_type.as_str()),
        ]
    }
}

/// A cleaned row ready for the warehouse. No field is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub sale_id: u64,
    pub list_year: i32,
    pub town: String,
    pub address: String,
    pub assessed_value: f64,
    pub sale_amount: f64,
    pub sales_ratio: f64,
    pub property_type: String,
}

impl NormalizedRecord {
    /// Render the record as warehouse columns, in table order.
    pub fn to_columns(&self) -> [String; 8] {
        [
            self.sale_id.to_string(),
            self.list_year.to_string(),
            self.town.clone(),
            self.address.clone(),
            format_float(self.assessed_value),
            format_float(self.sale_amount),
            format_float(self.sales_ratio),
            self.property_type.clone(),
        ]
    }
}

/// Format a float so that whole numbers keep a trailing `.0` (`150000.0`).
///
/// Output is deterministic, which the byte-identical reload guarantee relies on.
pub fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}
