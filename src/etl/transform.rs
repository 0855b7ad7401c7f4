//! Record normalization.
//!
//! `Residential Type` is dropped, rows with null-equivalent fields or
//! unparseable numbers are rejected, and accepted rows receive a surrogate
//! `SaleID`. Rejections never consume an id: ids are dense and strictly
//! increasing among accepted rows, in input order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{NormalizedRecord, RawRecord};

/// Tokens read as missing values, alongside empty fields
const NULL_TOKENS: [&str; 18] = [
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Why a single row was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("null field '{0}'")]
    NullField(String),

    #[error("cannot coerce '{value}' in field '{field}'")]
    TypeCoercion { field: String, value: String },
}

impl RejectReason {
    /// Stable key used when tallying rejections
    pub fn key(&self) -> String {
        match self {
            RejectReason::NullField(field) => format!("null:{}", field),
            RejectReason::TypeCoercion { field, .. } => format!("type:{}", field),
        }
    }
}

/// Whether a raw value should be treated as missing
pub fn is_null_equivalent(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || NULL_TOKENS.contains(&trimmed)
}

/// Hands out surrogate keys for one run
#[derive(Debug, Clone)]
pub struct SaleIdCounter {
    next: u64,
}

impl SaleIdCounter {
    pub fn new(base: u64) -> Self {
        Self { next: base }
    }

    /// The id the next accepted record will receive
    pub fn peek(&self) -> u64 {
        self.next
    }

    fn take(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for SaleIdCounter {
    fn default() -> Self {
        Self::new(1)
    }
}

fn parse_int(field: &str, value: &str) -> Result<i32, RejectReason> {
    value.trim().parse().map_err(|_| RejectReason::TypeCoercion {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_float(field: &str, value: &str) -> Result<f64, RejectReason> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(RejectReason::TypeCoercion {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Normalize one record.
///
/// The counter only advances when the record is accepted.
pub fn normalize(
    raw: &RawRecord,
    counter: &mut SaleIdCounter,
) -> Result<NormalizedRecord, RejectReason> {
    for (field, value) in raw.retained_fields() {
        if is_null_equivalent(value) {
            return Err(RejectReason::NullField(field.to_string()));
        }
    }

    let list_year = parse_int("List Year", &raw.list_year)?;
    let assessed_value = parse_float("Assessed Value", &raw.assessed_value)?;
    let sale_amount = parse_float("Sale Amount", &raw.sale_amount)?;
    let sales_ratio = parse_float("Sales Ratio", &raw.sales_ratio)?;

    Ok(NormalizedRecord {
        sale_id: counter.take(),
        list_year,
        town: raw.town.clone(),
        address: raw.address.clone(),
        assessed_value,
        sale_amount,
        sales_ratio,
        property_type: raw.property_type.clone(),
    })
}

/// Tally of rejected rows for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionSummary {
    pub total: u64,
    pub by_reason: BTreeMap<String, u64>,
    /// First few rejections with their source line, for diagnosis
    pub samples: Vec<(u64, RejectReason)>,
}

const MAX_SAMPLES: usize = 10;

impl RejectionSummary {
    fn record(&mut self, line: u64, reason: RejectReason) {
        self.total += 1;
        *self.by_reason.entry(reason.key()).or_insert(0) += 1;
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push((line, reason));
        }
    }
}

impl fmt::Display for RejectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rejected", self.total)?;
        if !self.by_reason.is_empty() {
            let parts: Vec<String> = self
                .by_reason
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Accepted records plus the rejection tally
#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub records: Vec<NormalizedRecord>,
    pub rejections: RejectionSummary,
}

impl TransformOutput {
    /// Fraction of input rows that were rejected (0.0 for empty input)
    pub fn rejection_ratio(&self) -> f64 {
        let total = self.records.len() as u64 + self.rejections.total;
        if total == 0 {
            0.0
        } else {
            self.rejections.total as f64 / total as f64
        }
    }
}

/// Normalize a whole run's worth of rows, skipping and counting rejections
pub fn transform_all<'a, I>(rows: I, counter: &mut SaleIdCounter) -> TransformOutput
where
    I: IntoIterator<Item = &'a RawRecord>,
{
    let mut output = TransformOutput::default();
    for raw in rows {
        match normalize(raw, counter) {
            Ok(record) => output.records.push(record),
            Err(reason) => output.rejections.record(raw.line, reason),
        }
    }
    output
}

/// Render accepted records as warehouse-ordered CSV with a header line.
///
/// Same records in, same bytes out.
pub fn to_csv(records: &[NormalizedRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(crate::domain::record::WAREHOUSE_COLUMNS)?;
    for record in records {
        writer.write_record(record.to_columns())?;
    }

    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hartford() -> RawRecord {
        RawRecord {
            line: 1,
            list_year: "2006".to_string(),
            town: "Hartford".to_string(),
            address: "123 Main St".to_string(),
            assessed_value: "150000".to_string(),
            sale_amount: "200000".to_string(),
            sales_ratio: "0.75".to_string(),
            property_type: "Residential".to_string(),
            residential_type: "Single Family".to_string(),
        }
    }

    #[test]
    fn test_accepts_complete_record() {
        let mut counter = SaleIdCounter::default();
        let record = normalize(&hartford(), &mut counter).unwrap();

        assert_eq!(record.sale_id, 1);
        assert_eq!(record.list_year, 2006);
        assert_eq!(record.town, "Hartford");
        assert_eq!(record.assessed_value, 150000.0);
        assert_eq!(record.sales_ratio, 0.75);
        assert_eq!(counter.peek(), 2);
    }

    #[test]
    fn test_residential_type_not_required() {
        let mut raw = hartford();
        raw.residential_type = String::new();
        assert!(normalize(&raw, &mut SaleIdCounter::default()).is_ok());
    }

    #[test]
    fn test_null_field_rejected_without_consuming_id() {
        let mut counter = SaleIdCounter::default();
        let mut raw = hartford();
        raw.town = "  ".to_string();

        let err = normalize(&raw, &mut counter).unwrap_err();
        assert_eq!(err, RejectReason::NullField("Town".to_string()));
        assert_eq!(counter.peek(), 1);
    }

    #[test]
    fn test_null_tokens() {
        for token in ["NaN", "null", "N/A", "<NA>", ""] {
            assert!(is_null_equivalent(token), "{} should be null", token);
        }
        assert!(!is_null_equivalent("Nantucket"));
        assert!(!is_null_equivalent("0"));
    }

    #[test]
    fn test_type_coercion_rejected() {
        let mut raw = hartford();
        raw.sale_amount = "two hundred".to_string();

        let err = normalize(&raw, &mut SaleIdCounter::default()).unwrap_err();
        assert!(matches!(err, RejectReason::TypeCoercion { ref field, .. } if field == "Sale Amount"));

        raw.sale_amount = "inf".to_string();
        assert!(normalize(&raw, &mut SaleIdCounter::default()).is_err());

        let mut raw = hartford();
        raw.list_year = "2006.5".to_string();
        assert!(normalize(&raw, &mut SaleIdCounter::default()).is_err());
    }

    #[test]
    fn test_strings_kept_verbatim() {
        let mut raw = hartford();
        raw.address = " 12 Elm St ".to_string();
        let record = normalize(&raw, &mut SaleIdCounter::default()).unwrap();
        assert_eq!(record.address, " 12 Elm St ");
    }

    #[test]
    fn test_transform_all_ids_dense_among_accepted() {
        let mut bad = hartford();
        bad.line = 2;
        bad.town = String::new();
        let mut third = hartford();
        third.line = 3;

        let rows = vec![hartford(), bad, third];
        let output = transform_all(&rows, &mut SaleIdCounter::new(1));

        let ids: Vec<u64> = output.records.iter().map(|r| r.sale_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(output.rejections.total, 1);
        assert_eq!(output.rejections.by_reason.get("null:Town"), Some(&1));
        assert_eq!(output.rejections.samples[0].0, 2);
        assert!((output.rejection_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_csv_output() {
        let output = transform_all(&[hartford()], &mut SaleIdCounter::default());
        let bytes = to_csv(&output.records).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(
            text,
            "SaleID,ListYear,Town,Address,AssessedValue,SaleAmount,SalesRatio,PropertyType\n\
             1,2006,Hartford,123 Main St,150000.0,200000.0,0.75,Residential\n"
        );
    }

    #[test]
    fn test_empty_input() {
        let output = transform_all(&Vec::<RawRecord>::new(), &mut SaleIdCounter::default());
        assert!(output.records.is_empty());
        assert_eq!(output.rejection_ratio(), 0.0);
    }
}
