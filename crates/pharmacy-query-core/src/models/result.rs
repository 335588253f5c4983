//! Execution results and provenance.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::records::{DrugId, RecordId};

/// Joins the two drugs in the label of a signed cost difference.
pub const DIFFERENCE_SEPARATOR: &str = " minus ";

/// Unit attached to a scalar or series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Usd,
    Tier,
}

impl Unit {
    pub fn label(&self) -> &'static str {
        match self {
            Unit::Usd => "USD",
            Unit::Tier => "tier",
        }
    }
}

/// One table cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
    Empty,
}

/// One point of a time series (period label is `YYYY-MM`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
    pub period: String,
    pub value: f64,
}

/// The computed answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultValue {
    Scalar {
        value: f64,
        unit: Unit,
        /// What the value measures, e.g. "latest unit cost of lisinopril"
        label: String,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
    },
    TimeSeries {
        unit: Unit,
        label: String,
        points: Vec<SeriesPoint>,
    },
}

/// A record that contributed to a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub record_id: RecordId,
    pub drug: DrugId,
    pub date: NaiveDate,
    /// The figure the record contributed (unit cost or tier)
    pub value: Option<f64>,
}

/// Which data a result was computed from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Provenance {
    pub sources: Vec<SourceRef>,
    /// Human-readable filters applied, in plan order
    pub filters: Vec<String>,
    /// Records matched by the filters but left out for missing cost
    pub excluded_missing: usize,
}

impl Provenance {
    pub fn record_ids(&self) -> Vec<&RecordId> {
        self.sources.iter().map(|s| &s.record_id).collect()
    }

    /// "N records excluded for missing data", when any were.
    pub fn exclusion_note(&self) -> Option<String> {
        match self.excluded_missing {
            0 => None,
            1 => Some("1 record excluded for missing data".to_string()),
            n => Some(format!("{} records excluded for missing data", n)),
        }
    }
}

/// Result of running a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub value: ResultValue,
    pub provenance: Provenance,
}

impl ExecutionResult {
    /// Every figure an answer may state, signed as computed.
    ///
    /// Dates, record ids and record counts are not figures; answers are
    /// checked against those as whole tokens.
    pub fn grounding_numbers(&self) -> Vec<f64> {
        let mut numbers = Vec::new();
        match &self.value {
            ResultValue::Scalar { value, .. } => numbers.push(*value),
            ResultValue::Table { rows, .. } => {
                for cell in rows.iter().flatten() {
                    match cell {
                        Cell::Number(n) => numbers.push(*n),
                        Cell::Text(text) if looks_like_date(text) => {}
                        // Copay descriptions carry their own figures
                        Cell::Text(text) => numbers.extend(numbers_in(text)),
                        Cell::Empty => {}
                    }
                }
            }
            ResultValue::TimeSeries { points, .. } => {
                numbers.extend(points.iter().map(|p| p.value));
            }
        }
        numbers.extend(self.provenance.sources.iter().filter_map(|s| s.value));
        numbers
    }

    /// Direction the result asserts: the sign of a cost difference, or a
    /// series' last point against its first. `None` when it asserts none.
    pub fn direction(&self) -> Option<Ordering> {
        match &self.value {
            ResultValue::Scalar { value, label, .. } if label.contains(DIFFERENCE_SEPARATOR) => {
                value.partial_cmp(&0.0)
            }
            ResultValue::TimeSeries { points, .. } if points.len() >= 2 => {
                let (first, last) = (points.first()?, points.last()?);
                last.value.partial_cmp(&first.value)
            }
            _ => None,
        }
    }

    /// Every date or period label in the result, as written in it.
    pub fn date_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .provenance
            .sources
            .iter()
            .map(|s| s.date.format("%Y-%m-%d").to_string())
            .collect();
        for filter in &self.provenance.filters {
            labels.extend(
                filter
                    .split(|c: char| !(c.is_ascii_digit() || c == '-'))
                    .filter(|token| looks_like_date(token))
                    .map(str::to_string),
            );
        }
        match &self.value {
            ResultValue::TimeSeries { points, .. } => {
                labels.extend(points.iter().map(|p| p.period.clone()));
            }
            ResultValue::Table { rows, .. } => {
                for cell in rows.iter().flatten() {
                    if let Cell::Text(text) = cell {
                        if looks_like_date(text) {
                            labels.push(text.clone());
                        }
                    }
                }
            }
            ResultValue::Scalar { .. } => {}
        }
        labels.sort();
        labels.dedup();
        labels
    }
}

fn looks_like_date(text: &str) -> bool {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

/// Decimal numbers embedded in free text, e.g. "20% coinsurance ($5.00-$25.00)".
fn numbers_in(text: &str) -> Vec<f64> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|token| token.trim_matches('.'))
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<f64>().ok())
        .collect()
}
