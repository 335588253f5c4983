//! Raw row parsing.
//!
//! Rows arrive as flat string maps. A row with `price_date` carries a price
//! observation, a row with `insurer` carries a coverage rule, and a row may
//! carry both.

use std::collections::HashMap;

use chrono::NaiveDate;

use super::{DatasetError, DatasetResult};
use crate::models::{CopayRule, CoverageStatus};

/// One source row, field name to raw text.
pub type RawRow = HashMap<String, String>;

/// Field names accepted in raw rows.
pub mod field {
    pub const DRUG_NAME: &str = "drug_name";
    pub const ALIASES: &str = "aliases";
    pub const GENERIC_EQUIVALENT: &str = "generic_equivalent";
    pub const STRENGTH: &str = "strength";
    pub const FORM: &str = "form";
    pub const UNIT_COST: &str = "unit_cost";
    pub const PRICE_DATE: &str = "price_date";
    pub const INSURER: &str = "insurer";
    pub const TIER: &str = "tier";
    pub const COPAY: &str = "copay";
    pub const COINSURANCE_PCT: &str = "coinsurance_pct";
    pub const MIN_COPAY: &str = "min_copay";
    pub const MAX_COPAY: &str = "max_copay";
    pub const COVERAGE_STATUS: &str = "coverage_status";
    pub const EFFECTIVE_DATE: &str = "effective_date";
    pub const EXPIRATION_DATE: &str = "expiration_date";
}

/// Separator between aliases in the `aliases` field.
pub const ALIAS_SEPARATOR: char = ';';

/// Rows from a JSON array of objects. Numbers and booleans are kept as their
/// JSON text; `null` fields are dropped.
pub fn rows_from_json(json: &str) -> DatasetResult<Vec<RawRow>> {
    let objects: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(json).map_err(|e| DatasetError::InvalidJson(e.to_string()))?;

    Ok(objects
        .into_iter()
        .map(|object| {
            object
                .into_iter()
                .filter_map(|(key, value)| {
                    let text = match value {
                        serde_json::Value::Null => return None,
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    Some((key, text))
                })
                .collect()
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedRow {
    pub drug_name: String,
    pub aliases: Vec<String>,
    pub generic: Option<String>,
    pub observation: Option<PriceObservation>,
    pub coverage: Option<CoverageTerms>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PriceObservation {
    pub strength: Option<String>,
    pub form: Option<String>,
    pub unit_cost: Option<f64>,
    pub observed_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CoverageTerms {
    pub insurer: String,
    pub tier: u8,
    pub copay: CopayRule,
    pub status: CoverageStatus,
    pub effective_from: NaiveDate,
    pub effective_until: Option<NaiveDate>,
}

/// Parse one row. `row_number` is 1-based and only used in errors.
pub(crate) fn parse_row(row_number: usize, row: &RawRow) -> DatasetResult<ParsedRow> {
    let drug_name = text(row, field::DRUG_NAME)
        .ok_or(DatasetError::MissingField {
            row: row_number,
            field: field::DRUG_NAME,
        })?
        .to_string();

    let aliases = text(row, field::ALIASES)
        .map(|raw| {
            raw.split(ALIAS_SEPARATOR)
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let generic = text(row, field::GENERIC_EQUIVALENT).map(str::to_string);

    let observation = match text(row, field::PRICE_DATE) {
        Some(raw_date) => Some(PriceObservation {
            strength: text(row, field::STRENGTH).map(str::to_string),
            form: text(row, field::FORM).map(|f| f.to_lowercase()),
            unit_cost: text(row, field::UNIT_COST)
                .map(|v| parse_amount(row_number, field::UNIT_COST, v))
                .transpose()?,
            observed_on: parse_date(row_number, field::PRICE_DATE, raw_date)?,
        }),
        None => None,
    };

    let coverage = match text(row, field::INSURER) {
        Some(insurer) => Some(parse_coverage(row_number, row, insurer)?),
        None => None,
    };

    if observation.is_none() && coverage.is_none() {
        return Err(DatasetError::UnclassifiedRow { row: row_number });
    }

    Ok(ParsedRow {
        drug_name,
        aliases,
        generic,
        observation,
        coverage,
    })
}

fn parse_coverage(row_number: usize, row: &RawRow, insurer: &str) -> DatasetResult<CoverageTerms> {
    let raw_tier = text(row, field::TIER).ok_or(DatasetError::MissingField {
        row: row_number,
        field: field::TIER,
    })?;
    let tier = raw_tier
        .parse::<u8>()
        .ok()
        .filter(|t| (1..=5).contains(t))
        .ok_or_else(|| invalid(row_number, field::TIER, raw_tier))?;

    let raw_effective = text(row, field::EFFECTIVE_DATE).ok_or(DatasetError::MissingField {
        row: row_number,
        field: field::EFFECTIVE_DATE,
    })?;
    let effective_from = parse_date(row_number, field::EFFECTIVE_DATE, raw_effective)?;

    let effective_until = match text(row, field::EXPIRATION_DATE) {
        Some(raw) => {
            let until = parse_date(row_number, field::EXPIRATION_DATE, raw)?;
            if until < effective_from {
                return Err(invalid(row_number, field::EXPIRATION_DATE, raw));
            }
            Some(until)
        }
        None => None,
    };

    let status = match text(row, field::COVERAGE_STATUS) {
        Some(raw) => CoverageStatus::parse(raw)
            .ok_or_else(|| invalid(row_number, field::COVERAGE_STATUS, raw))?,
        None => CoverageStatus::Covered,
    };

    Ok(CoverageTerms {
        insurer: insurer.to_string(),
        tier,
        copay: parse_copay(row_number, row)?,
        status,
        effective_from,
        effective_until,
    })
}

fn parse_copay(row_number: usize, row: &RawRow) -> DatasetResult<CopayRule> {
    let optional_amount = |name: &'static str| {
        text(row, name)
            .map(|v| parse_amount(row_number, name, v))
            .transpose()
    };

    if let Some(amount) = optional_amount(field::COPAY)? {
        return Ok(CopayRule::Flat { amount });
    }

    match text(row, field::COINSURANCE_PCT) {
        Some(raw) => {
            let percent = parse_amount(row_number, field::COINSURANCE_PCT, raw)?;
            if percent > 100.0 {
                return Err(invalid(row_number, field::COINSURANCE_PCT, raw));
            }
            let min_copay = optional_amount(field::MIN_COPAY)?;
            let max_copay = optional_amount(field::MAX_COPAY)?;
            if let (Some(min), Some(max)) = (min_copay, max_copay) {
                if min > max {
                    return Err(DatasetError::InvalidValue {
                        row: row_number,
                        field: field::MIN_COPAY,
                        value: format!("{} > max_copay {}", min, max),
                    });
                }
            }
            Ok(CopayRule::Coinsurance {
                percent,
                min_copay,
                max_copay,
            })
        }
        None => Ok(CopayRule::Unspecified),
    }
}

/// Trimmed, non-empty field value.
fn text<'a>(row: &'a RawRow, name: &str) -> Option<&'a str> {
    row.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_date(row_number: usize, name: &'static str, raw: &str) -> DatasetResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid(row_number, name, raw))
}

/// Non-negative finite amount. Accepts a leading `$` and thousands separators.
fn parse_amount(row_number: usize, name: &'static str, raw: &str) -> DatasetResult<f64> {
    let cleaned: String = raw
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| invalid(row_number, name, raw))
}

fn invalid(row_number: usize, name: &'static str, raw: &str) -> DatasetError {
    DatasetError::InvalidValue {
        row: row_number,
        field: name,
        value: raw.to_string(),
    }
}
