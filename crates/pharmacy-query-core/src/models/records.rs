//! Pharmacy dataset records.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Canonical drug identifier (lowercase, single-spaced).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DrugId(String);

impl DrugId {
    pub fn new(name: &str) -> Self {
        Self(normalize_name(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DrugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical insurer identifier (lowercase, single-spaced).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InsurerId(String);

impl InsurerId {
    pub fn new(name: &str) -> Self {
        Self(normalize_name(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InsurerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a loaded record (`med-0001`, `cov-0001`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn medication(index: usize) -> Self {
        Self(format!("med-{:04}", index))
    }

    pub fn coverage(index: usize) -> Self {
        Self(format!("cov-{:04}", index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase and collapse whitespace; the key used for every name lookup.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A drug known to the dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrugEntry {
    pub id: DrugId,
    /// Name as first seen in the source data
    pub display_name: String,
    /// Alternative names (brand names, spellings) as given in the source
    pub aliases: Vec<String>,
    /// Generic equivalent of a brand drug
    pub generic: Option<DrugId>,
}

/// One price observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicationRecord {
    pub id: RecordId,
    pub drug: DrugId,
    /// Strength, e.g. "10mg"
    pub strength: Option<String>,
    /// Dosage form, e.g. "tablet"
    pub form: Option<String>,
    /// Unit cost in USD; `None` when the source left it blank
    pub unit_cost: Option<f64>,
    pub observed_on: NaiveDate,
}

/// Patient cost-sharing rule for a covered drug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CopayRule {
    /// Fixed copay per fill
    Flat { amount: f64 },
    /// Patient pays a percentage of the unit cost, clamped to an optional band
    Coinsurance {
        percent: f64,
        min_copay: Option<f64>,
        max_copay: Option<f64>,
    },
    /// No cost-sharing rule given
    Unspecified,
}

impl CopayRule {
    /// Estimated patient cost for one unit, rounded to cents.
    pub fn patient_cost(&self, unit_cost: Option<f64>) -> Option<f64> {
        match self {
            CopayRule::Flat { amount } => Some(round_cents(*amount)),
            CopayRule::Coinsurance {
                percent,
                min_copay,
                max_copay,
            } => {
                let mut cost = unit_cost? * percent / 100.0;
                if let Some(max) = max_copay {
                    cost = cost.min(*max);
                }
                if let Some(min) = min_copay {
                    cost = cost.max(*min);
                }
                Some(round_cents(cost))
            }
            CopayRule::Unspecified => None,
        }
    }

    /// Short human description, e.g. "20% coinsurance ($5.00-$25.00)".
    pub fn describe(&self) -> String {
        match self {
            CopayRule::Flat { amount } => format!("${:.2} copay", amount),
            CopayRule::Coinsurance {
                percent,
                min_copay,
                max_copay,
            } => {
                let band = match (min_copay, max_copay) {
                    (Some(min), Some(max)) => format!(" (${:.2}-${:.2})", min, max),
                    (Some(min), None) => format!(" (min ${:.2})", min),
                    (None, Some(max)) => format!(" (max ${:.2})", max),
                    (None, None) => String::new(),
                };
                format!("{}% coinsurance{}", percent, band)
            }
            CopayRule::Unspecified => "unspecified".to_string(),
        }
    }
}

/// Formulary coverage status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CoverageStatus {
    Covered,
    PriorAuthorizationRequired,
    StepTherapyRequired,
    NotCovered,
}

impl CoverageStatus {
    /// Parse the spellings seen in source spreadsheets.
    pub fn parse(value: &str) -> Option<Self> {
        match normalize_name(value).replace(['_', '-'], " ").as_str() {
            "covered" => Some(CoverageStatus::Covered),
            "prior authorization required" | "prior auth required" | "prior authorization" | "pa required" => {
                Some(CoverageStatus::PriorAuthorizationRequired)
            }
            "step therapy required" | "step therapy" => Some(CoverageStatus::StepTherapyRequired),
            "not covered" | "excluded" => Some(CoverageStatus::NotCovered),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CoverageStatus::Covered => "Covered",
            CoverageStatus::PriorAuthorizationRequired => "Prior Authorization Required",
            CoverageStatus::StepTherapyRequired => "Step Therapy Required",
            CoverageStatus::NotCovered => "Not Covered",
        }
    }
}

/// One insurer's coverage of one drug over an effective date range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageRecord {
    pub id: RecordId,
    pub insurer: InsurerId,
    pub drug: DrugId,
    /// Formulary tier, 1 (preferred) to 5
    pub tier: u8,
    pub copay: CopayRule,
    pub status: CoverageStatus,
    pub effective_from: NaiveDate,
    /// Inclusive end date; `None` means open-ended
    pub effective_until: Option<NaiveDate>,
}

impl CoverageRecord {
    /// Check if this record is in force on `date`.
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        date >= self.effective_from && self.effective_until.map_or(true, |end| date <= end)
    }
}

/// Round a monetary amount to cents.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
