//! Small datasets shared by unit tests.

pub(crate) use super::sample::row;
use super::{DatasetModel, RawRow};

/// DrugA $50 (Jan) and $55 (Feb), DrugB $40 with a blank March price,
/// DrugAB as a near-namesake, InsurerX covering DrugA at tier 2.
pub(crate) fn scenario_rows() -> Vec<RawRow> {
    vec![
        row(&[
            ("drug_name", "DrugA"),
            ("aliases", "Alphacor"),
            ("price_date", "2024-01-10"),
            ("unit_cost", "50"),
        ]),
        row(&[("drug_name", "DrugA"), ("price_date", "2024-02-10"), ("unit_cost", "55")]),
        row(&[("drug_name", "DrugB"), ("price_date", "2024-02-01"), ("unit_cost", "40")]),
        row(&[("drug_name", "DrugB"), ("price_date", "2024-03-01"), ("unit_cost", "")]),
        row(&[("drug_name", "DrugAB"), ("price_date", "2024-02-01"), ("unit_cost", "70")]),
        row(&[
            ("drug_name", "DrugA"),
            ("insurer", "InsurerX"),
            ("tier", "2"),
            ("coinsurance_pct", "20"),
            ("min_copay", "5"),
            ("max_copay", "25"),
            ("effective_date", "2024-01-01"),
            ("expiration_date", "2024-06-30"),
        ]),
        row(&[
            ("drug_name", "DrugA"),
            ("insurer", "InsurerX"),
            ("tier", "3"),
            ("copay", "15"),
            ("coverage_status", "Step Therapy Required"),
            ("effective_date", "2024-07-01"),
        ]),
        row(&[
            ("drug_name", "DrugA"),
            ("insurer", "InsurerY"),
            ("tier", "1"),
            ("copay", "5"),
            ("effective_date", "2024-01-01"),
        ]),
    ]
}

pub(crate) fn scenario_dataset() -> DatasetModel {
    DatasetModel::load(&scenario_rows()).expect("scenario rows load")
}
