//! Parameter normalization: dates, insurers, and which slots an intent keeps.

use chrono::NaiveDate;

use crate::dataset::DatasetModel;
use crate::error::{QueryError, QueryResult};
use crate::models::{InsurerId, IntentTag, ParamKey};

/// Strict `YYYY-MM-DD` parse. Anything else is unresolved, never coerced.
pub fn parse_date(slot: ParamKey, raw: &str) -> QueryResult<NaiveDate> {
    let valid_shape = raw.len() == 10 && raw.as_bytes()[4] == b'-' && raw.as_bytes()[7] == b'-';
    if !valid_shape {
        return Err(QueryError::unresolved(format!(
            "`{}` is not a YYYY-MM-DD date for {}",
            raw,
            slot.as_str()
        )));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        QueryError::unresolved(format!("`{}` is not a valid date for {}", raw, slot.as_str()))
    })
}

/// Match an insurer name against the dataset, case-insensitively.
pub fn resolve_insurer(dataset: &DatasetModel, raw: &str) -> QueryResult<InsurerId> {
    dataset
        .insurer_id(raw)
        .ok_or_else(|| QueryError::unresolved(format!("unknown insurer `{}`", raw.trim())))
}

/// Parameter slots each intent's plan reads.
pub fn accepted_slots(tag: IntentTag) -> &'static [ParamKey] {
    match tag {
        IntentTag::CostLookup => &[ParamKey::Drugs, ParamKey::From, ParamKey::To, ParamKey::Aggregation],
        IntentTag::CostTrend => &[ParamKey::Drugs, ParamKey::From, ParamKey::To],
        IntentTag::CostComparison => &[ParamKey::Drugs, ParamKey::From, ParamKey::To],
        IntentTag::CoverageLookup | IntentTag::TierLookup => {
            &[ParamKey::Drugs, ParamKey::Insurer, ParamKey::AsOf]
        }
    }
}

/// Whether the intent reads coverage records and therefore needs a date.
pub fn needs_as_of(tag: IntentTag) -> bool {
    matches!(tag, IntentTag::CoverageLookup | IntentTag::TierLookup)
}
