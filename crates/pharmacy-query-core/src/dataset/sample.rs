//! Built-in demonstration dataset.
//!
//! Ten medications with three monthly price observations each and
//! Commercial/Medicare/Medicaid coverage rules for 2024.

use super::{field, DatasetModel, DatasetResult, RawRow};

/// (name, aliases, form, strength, January 2024 unit cost)
const MEDICATIONS: &[(&str, &str, &str, &str, f64)] = &[
    ("Lisinopril", "Zestril;Prinivil", "tablet", "10mg", 15.99),
    ("Metformin", "Glucophage", "tablet", "500mg", 12.99),
    ("Amlodipine", "Norvasc", "tablet", "5mg", 18.99),
    ("Lipitor", "", "tablet", "20mg", 145.99),
    ("Atorvastatin", "", "tablet", "20mg", 25.99),
    ("Januvia", "Sitagliptin", "tablet", "100mg", 425.99),
    ("Humira", "Adalimumab", "pen", "40mg", 5250.99),
    ("Enbrel", "Etanercept", "syringe", "50mg", 4890.99),
    ("Adderall XR", "Mixed Amphetamine Salts ER", "capsule", "20mg", 225.99),
    ("Xanax", "Alprazolam", "tablet", "0.5mg", 125.99),
];

/// (brand, generic equivalent)
const GENERICS: &[(&str, &str)] = &[("Lipitor", "Atorvastatin")];

/// Month-over-month price movement in cents, per medication index.
const PRICE_STEPS: &[i64] = &[50, 0, -25, 300, 0, 1000, 5000, -2500, 0, 200];

/// (drug, insurer, tier, coinsurance %, min copay, max copay, status)
const COVERAGE: &[(&str, &str, u8, f64, f64, f64, &str)] = &[
    ("Lisinopril", "Commercial", 1, 20.0, 5.0, 25.0, "Covered"),
    ("Lipitor", "Commercial", 3, 30.0, 30.0, 75.0, "Prior Authorization Required"),
    ("Humira", "Commercial", 4, 40.0, 100.0, 500.0, "Prior Authorization Required"),
    ("Lisinopril", "Medicare", 1, 15.0, 3.0, 20.0, "Covered"),
    ("Lipitor", "Medicare", 3, 25.0, 25.0, 65.0, "Step Therapy Required"),
    ("Lisinopril", "Medicaid", 1, 10.0, 1.0, 15.0, "Covered"),
    ("Humira", "Medicaid", 4, 5.0, 3.0, 25.0, "Prior Authorization Required"),
];

const PRICE_DATES: [&str; 3] = ["2024-01-15", "2024-02-15", "2024-03-15"];

/// Raw rows of the demonstration dataset.
pub fn sample_rows() -> Vec<RawRow> {
    let mut rows = Vec::new();

    for (index, &(name, aliases, form, strength, base)) in MEDICATIONS.iter().enumerate() {
        let base_cents = (base * 100.0).round() as i64;
        let step = PRICE_STEPS.get(index).copied().unwrap_or(0);
        let generic = GENERICS
            .iter()
            .find(|(brand, _)| *brand == name)
            .map_or("", |(_, generic)| *generic);
        for (month, date) in PRICE_DATES.iter().enumerate() {
            // Amlodipine's March price was never reported.
            let unit_cost = if name == "Amlodipine" && month == 2 {
                String::new()
            } else {
                let cents = base_cents + step * month as i64;
                format!("{}.{:02}", cents / 100, cents % 100)
            };
            rows.push(row(&[
                (field::DRUG_NAME, name),
                (field::ALIASES, aliases),
                (field::GENERIC_EQUIVALENT, generic),
                (field::FORM, form),
                (field::STRENGTH, strength),
                (field::UNIT_COST, unit_cost.as_str()),
                (field::PRICE_DATE, *date),
            ]));
        }
    }

    for &(drug, insurer, tier, pct, min, max, status) in COVERAGE {
        rows.push(row(&[
            (field::DRUG_NAME, drug),
            (field::INSURER, insurer),
            (field::TIER, tier.to_string().as_str()),
            (field::COINSURANCE_PCT, pct.to_string().as_str()),
            (field::MIN_COPAY, min.to_string().as_str()),
            (field::MAX_COPAY, max.to_string().as_str()),
            (field::COVERAGE_STATUS, status),
            (field::EFFECTIVE_DATE, "2024-01-01"),
            (field::EXPIRATION_DATE, "2024-12-31"),
        ]));
    }

    rows
}

/// The demonstration dataset, loaded.
pub fn sample_dataset() -> DatasetResult<DatasetModel> {
    DatasetModel::load(&sample_rows())
}

/// A raw row from field/value pairs.
pub(crate) fn row(pairs: &[(&str, &str)]) -> RawRow {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
