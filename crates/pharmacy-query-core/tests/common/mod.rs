//! Shared fixtures for integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use pharmacy_query_core::dataset::rows_from_json;
use pharmacy_query_core::{DatasetModel, RawRow};

/// DrugA $50 (Jan) and $55 (Feb), DrugB $40 with a blank March price,
/// DrugAB as a near-namesake, InsurerX covering DrugA at tier 2 until June
/// and tier 3 from July, InsurerY at tier 1.
pub const SCENARIO_JSON: &str = r#"[
    {"drug_name": "DrugA", "aliases": "Alphacor", "price_date": "2024-01-10", "unit_cost": "50"},
    {"drug_name": "DrugA", "price_date": "2024-02-10", "unit_cost": "55"},
    {"drug_name": "DrugB", "price_date": "2024-02-01", "unit_cost": "40"},
    {"drug_name": "DrugB", "price_date": "2024-03-01", "unit_cost": ""},
    {"drug_name": "DrugAB", "price_date": "2024-02-01", "unit_cost": "70"},
    {"drug_name": "DrugA", "insurer": "InsurerX", "tier": "2", "coinsurance_pct": "20",
     "min_copay": "5", "max_copay": "25", "effective_date": "2024-01-01", "expiration_date": "2024-06-30"},
    {"drug_name": "DrugA", "insurer": "InsurerX", "tier": "3", "copay": "15",
     "coverage_status": "Step Therapy Required", "effective_date": "2024-07-01"},
    {"drug_name": "DrugA", "insurer": "InsurerY", "tier": "1", "copay": "5", "effective_date": "2024-01-01"}
]"#;

pub fn scenario_rows() -> Vec<RawRow> {
    rows_from_json(SCENARIO_JSON).unwrap()
}

pub fn scenario_dataset() -> DatasetModel {
    DatasetModel::load(&scenario_rows()).unwrap()
}

pub fn row(pairs: &[(&str, &str)]) -> RawRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}
