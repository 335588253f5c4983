//! Execution Engine: runs a `QueryPlan` against a `DatasetModel`.
//!
//! Null-safe: observations without a unit cost never enter an aggregate and
//! are counted in provenance instead. Groups live in ordered maps, so output
//! is identical across runs.

use std::collections::BTreeMap;

use crate::dataset::DatasetModel;
use crate::error::{QueryError, QueryResult};
use crate::models::{
    round_cents, Aggregation, Cell, CoverageRecord, DrugId, ExecutionResult, InsurerId,
    MedicationRecord, Provenance, ResultValue, SeriesPoint, SourceRef, Unit, DIFFERENCE_SEPARATOR,
};
use crate::planner::{Finish, GroupKey, Predicate, QueryPlan, Reduce, Source};

/// Columns of a coverage table.
pub const COVERAGE_COLUMNS: [&str; 8] = [
    "insurer",
    "tier",
    "status",
    "copay_rule",
    "patient_cost",
    "unit_cost",
    "effective_from",
    "effective_until",
];

/// Columns of a tier table.
pub const TIER_COLUMNS: [&str; 4] = ["insurer", "tier", "status", "effective_from"];

/// Run a plan.
pub fn execute(plan: &QueryPlan, dataset: &DatasetModel) -> QueryResult<ExecutionResult> {
    let result = match plan.source {
        Source::Medications => execute_costs(plan, dataset),
        Source::Coverage => execute_coverage(plan, dataset),
    }?;
    tracing::debug!(
        intent = %plan.intent,
        sources = result.provenance.sources.len(),
        excluded_missing = result.provenance.excluded_missing,
        "plan executed"
    );
    Ok(result)
}

/// One aggregated group.
struct GroupValue<'a> {
    value: f64,
    contributors: Vec<&'a MedicationRecord>,
}

fn execute_costs(plan: &QueryPlan, dataset: &DatasetModel) -> QueryResult<ExecutionResult> {
    let aggregation = match plan.reduce {
        Reduce::Cost(aggregation) => aggregation,
        Reduce::MostRecentlyEffective => return Err(no_data(plan)),
    };

    let mut excluded_missing = 0;
    let mut groups: BTreeMap<String, Vec<&MedicationRecord>> = BTreeMap::new();
    for drug in plan.drugs() {
        for record in dataset.records(drug) {
            if !observation_matches(plan, record) {
                continue;
            }
            if record.unit_cost.is_none() {
                excluded_missing += 1;
                continue;
            }
            let key = match plan.group_by {
                GroupKey::Month => record.observed_on.format("%Y-%m").to_string(),
                GroupKey::Drug | GroupKey::Insurer => record.drug.as_str().to_string(),
            };
            groups.entry(key).or_default().push(record);
        }
    }

    let reduced: BTreeMap<String, GroupValue<'_>> = groups
        .into_iter()
        .filter_map(|(key, records)| reduce_costs(aggregation, records).map(|g| (key, g)))
        .collect();

    let (value, contributors) = match &plan.finish {
        Finish::CostScalar => {
            let drug = single(plan.drugs()).ok_or_else(|| no_data(plan))?;
            let group = reduced.get(drug.as_str()).ok_or_else(|| no_data(plan))?;
            let value = ResultValue::Scalar {
                value: group.value,
                unit: Unit::Usd,
                label: format!(
                    "{} unit cost of {}",
                    aggregation_label(aggregation),
                    dataset.drug_display(drug)
                ),
            };
            (value, group.contributors.clone())
        }
        Finish::TimeSeries => {
            if reduced.is_empty() {
                return Err(no_data(plan));
            }
            let drug = single(plan.drugs()).ok_or_else(|| no_data(plan))?;
            let points = reduced
                .iter()
                .map(|(period, g)| SeriesPoint {
                    period: period.clone(),
                    value: g.value,
                })
                .collect();
            let contributors = reduced.values().flat_map(|g| g.contributors.iter().copied()).collect();
            let value = ResultValue::TimeSeries {
                unit: Unit::Usd,
                label: format!("monthly mean unit cost of {}", dataset.drug_display(drug)),
                points,
            };
            (value, contributors)
        }
        Finish::SignedDifference { first, second } => {
            let a = reduced.get(first.as_str()).ok_or_else(|| no_data(plan))?;
            let b = reduced.get(second.as_str()).ok_or_else(|| no_data(plan))?;
            let value = ResultValue::Scalar {
                value: round_cents(a.value - b.value),
                unit: Unit::Usd,
                label: format!(
                    "latest unit cost of {}{}{}",
                    dataset.drug_display(first),
                    DIFFERENCE_SEPARATOR,
                    dataset.drug_display(second)
                ),
            };
            let contributors = a.contributors.iter().chain(b.contributors.iter()).copied().collect();
            (value, contributors)
        }
        Finish::CoverageTable | Finish::TierScalar | Finish::TierTable => return Err(no_data(plan)),
    };

    Ok(ExecutionResult {
        value,
        provenance: Provenance {
            sources: contributors.into_iter().map(medication_source).collect(),
            filters: plan.filter_descriptions(),
            excluded_missing,
        },
    })
}

fn observation_matches(plan: &QueryPlan, record: &MedicationRecord) -> bool {
    plan.predicates.iter().all(|p| match p {
        Predicate::ObservedBetween { from, to } => {
            from.map_or(true, |f| record.observed_on >= f) && to.map_or(true, |t| record.observed_on <= t)
        }
        _ => true,
    })
}

/// Collapse a group of priced records, which arrive ordered by date.
fn reduce_costs(aggregation: Aggregation, records: Vec<&MedicationRecord>) -> Option<GroupValue<'_>> {
    let priced: Vec<(&MedicationRecord, f64)> = records
        .into_iter()
        .filter_map(|r| r.unit_cost.map(|c| (r, c)))
        .collect();
    if priced.is_empty() {
        return None;
    }

    Some(match aggregation {
        Aggregation::Mean => GroupValue {
            value: round_cents(priced.iter().map(|(_, c)| c).sum::<f64>() / priced.len() as f64),
            contributors: priced.iter().map(|(r, _)| *r).collect(),
        },
        Aggregation::Min => pick(&priced, |candidate, best| candidate < best),
        Aggregation::Max => pick(&priced, |candidate, best| candidate > best),
        Aggregation::Latest => pick(&priced, |_, _| true),
    })
}

/// Record preferred by `better`, scanning in date order.
fn pick<'a>(priced: &[(&'a MedicationRecord, f64)], better: impl Fn(f64, f64) -> bool) -> GroupValue<'a> {
    let mut best = priced[0];
    for candidate in &priced[1..] {
        if better(candidate.1, best.1) {
            best = *candidate;
        }
    }
    GroupValue {
        value: round_cents(best.1),
        contributors: vec![best.0],
    }
}

fn execute_coverage(plan: &QueryPlan, dataset: &DatasetModel) -> QueryResult<ExecutionResult> {
    let drug = single(plan.drugs()).ok_or_else(|| no_data(plan))?;
    let mut insurer: Option<&InsurerId> = None;
    let mut as_of = None;
    for predicate in &plan.predicates {
        match predicate {
            Predicate::InsurerIs { insurer: i } => insurer = Some(i),
            Predicate::EffectiveOn { date } => as_of = Some(*date),
            _ => {}
        }
    }

    // Most recently effective record per insurer
    let mut current: BTreeMap<&InsurerId, &CoverageRecord> = BTreeMap::new();
    for record in dataset.coverage_for(drug, insurer) {
        if !as_of.map_or(true, |d| record.is_effective_on(d)) {
            continue;
        }
        let slot = current.entry(&record.insurer).or_insert(record);
        if (record.effective_from, &record.id) > (slot.effective_from, &slot.id) {
            *slot = record;
        }
    }
    if current.is_empty() {
        return Err(no_data(plan));
    }

    let latest_price = dataset.latest_priced_on(drug, as_of);
    let mut sources: Vec<SourceRef> = current
        .values()
        .map(|r| SourceRef {
            record_id: r.id.clone(),
            drug: r.drug.clone(),
            date: r.effective_from,
            value: Some(f64::from(r.tier)),
        })
        .collect();

    let value = match plan.finish {
        Finish::TierScalar => {
            let record = current.values().next().ok_or_else(|| no_data(plan))?;
            ResultValue::Scalar {
                value: f64::from(record.tier),
                unit: Unit::Tier,
                label: format!(
                    "formulary tier of {} under {}",
                    dataset.drug_display(drug),
                    dataset.insurer_display(&record.insurer)
                ),
            }
        }
        Finish::TierTable => ResultValue::Table {
            columns: TIER_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: current
                .values()
                .map(|r| {
                    vec![
                        Cell::Text(dataset.insurer_display(&r.insurer)),
                        Cell::Number(f64::from(r.tier)),
                        Cell::Text(r.status.label().to_string()),
                        Cell::Text(r.effective_from.format("%Y-%m-%d").to_string()),
                    ]
                })
                .collect(),
        },
        _ => {
            let unit_cost = latest_price.and_then(|r| r.unit_cost);
            if let Some(record) = latest_price {
                sources.push(medication_source(record));
            }
            ResultValue::Table {
                columns: COVERAGE_COLUMNS.iter().map(|c| c.to_string()).collect(),
                rows: current
                    .values()
                    .map(|r| {
                        vec![
                            Cell::Text(dataset.insurer_display(&r.insurer)),
                            Cell::Number(f64::from(r.tier)),
                            Cell::Text(r.status.label().to_string()),
                            Cell::Text(r.copay.describe()),
                            optional_number(r.copay.patient_cost(unit_cost)),
                            optional_number(unit_cost),
                            Cell::Text(r.effective_from.format("%Y-%m-%d").to_string()),
                            r.effective_until
                                .map(|d| Cell::Text(d.format("%Y-%m-%d").to_string()))
                                .unwrap_or(Cell::Empty),
                        ]
                    })
                    .collect(),
            }
        }
    };

    Ok(ExecutionResult {
        value,
        provenance: Provenance {
            sources,
            filters: plan.filter_descriptions(),
            excluded_missing: 0,
        },
    })
}

fn medication_source(record: &MedicationRecord) -> SourceRef {
    SourceRef {
        record_id: record.id.clone(),
        drug: record.drug.clone(),
        date: record.observed_on,
        value: record.unit_cost,
    }
}

fn optional_number(value: Option<f64>) -> Cell {
    value.map(Cell::Number).unwrap_or(Cell::Empty)
}

fn single(drugs: &[DrugId]) -> Option<&DrugId> {
    match drugs {
        [drug] => Some(drug),
        _ => None,
    }
}

fn aggregation_label(aggregation: Aggregation) -> &'static str {
    match aggregation {
        Aggregation::Mean => "mean",
        Aggregation::Min => "lowest",
        Aggregation::Max => "highest",
        Aggregation::Latest => "latest",
    }
}

fn no_data(plan: &QueryPlan) -> QueryError {
    QueryError::NoMatchingData {
        filters: plan.filter_descriptions(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fixtures::scenario_dataset;
    use crate::models::{IntentTag, ParamKey, ParamValue, ResolvedIntent};
    use crate::planner::plan;
    use chrono::NaiveDate;

    fn run(intent: ResolvedIntent) -> QueryResult<ExecutionResult> {
        let dataset = scenario_dataset();
        execute(&plan(&intent)?, &dataset)
    }

    fn drugs(names: &[&str]) -> ParamValue {
        ParamValue::Drugs(names.iter().map(|n| DrugId::new(n)).collect())
    }

    fn date(y: i32, m: u32, d: u32) -> ParamValue {
        ParamValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn test_trend_scenario() {
        let result = run(ResolvedIntent::new(IntentTag::CostTrend).with(ParamKey::Drugs, drugs(&["DrugA"]))).unwrap();

        match result.value {
            ResultValue::TimeSeries { points, unit, .. } => {
                assert_eq!(unit, Unit::Usd);
                assert_eq!(
                    points,
                    vec![
                        SeriesPoint { period: "2024-01".into(), value: 50.0 },
                        SeriesPoint { period: "2024-02".into(), value: 55.0 },
                    ]
                );
            }
            other => panic!("expected time series, got {:?}", other),
        }
        assert_eq!(result.provenance.sources.len(), 2);
    }

    #[test]
    fn test_comparison_scenario() {
        let result = run(
            ResolvedIntent::new(IntentTag::CostComparison).with(ParamKey::Drugs, drugs(&["DrugA", "DrugB"])),
        )
        .unwrap();

        assert!(matches!(result.value, ResultValue::Scalar { value, .. } if value == 15.0));
        let values: Vec<Option<f64>> = result.provenance.sources.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![Some(55.0), Some(40.0)]);
        // DrugB's March observation has no price
        assert_eq!(result.provenance.excluded_missing, 1);
    }

    #[test]
    fn test_comparison_is_signed_by_mention_order() {
        let result = run(
            ResolvedIntent::new(IntentTag::CostComparison).with(ParamKey::Drugs, drugs(&["DrugB", "DrugA"])),
        )
        .unwrap();
        assert!(matches!(result.value, ResultValue::Scalar { value, .. } if value == -15.0));
    }

    #[test]
    fn test_cost_aggregations() {
        let base = ResolvedIntent::new(IntentTag::CostLookup).with(ParamKey::Drugs, drugs(&["DrugA"]));
        let scalar = |intent: ResolvedIntent| match run(intent).unwrap().value {
            ResultValue::Scalar { value, .. } => value,
            other => panic!("expected scalar, got {:?}", other),
        };

        assert_eq!(scalar(base.clone()), 55.0);
        assert_eq!(
            scalar(base.clone().with(ParamKey::Aggregation, ParamValue::Aggregation(Aggregation::Mean))),
            52.5
        );
        assert_eq!(
            scalar(base.clone().with(ParamKey::Aggregation, ParamValue::Aggregation(Aggregation::Min))),
            50.0
        );
        assert_eq!(scalar(base.with(ParamKey::To, date(2024, 1, 31))), 50.0);
    }

    #[test]
    fn test_only_missing_prices_is_no_data() {
        let err = run(
            ResolvedIntent::new(IntentTag::CostLookup)
                .with(ParamKey::Drugs, drugs(&["DrugB"]))
                .with(ParamKey::From, date(2024, 3, 1)),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::NoMatchingData { ref filters } if filters.len() == 2));
    }

    #[test]
    fn test_range_without_observations_is_no_data() {
        let err = run(
            ResolvedIntent::new(IntentTag::CostTrend)
                .with(ParamKey::Drugs, drugs(&["DrugA"]))
                .with(ParamKey::From, date(2025, 1, 1)),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::NoMatchingData { .. }));
    }

    #[test]
    fn test_coverage_table_picks_record_in_force() {
        let result = run(
            ResolvedIntent::new(IntentTag::CoverageLookup)
                .with(ParamKey::Drugs, drugs(&["DrugA"]))
                .with(ParamKey::AsOf, date(2024, 3, 1)),
        )
        .unwrap();

        match result.value {
            ResultValue::Table { columns, rows } => {
                assert_eq!(columns.len(), COVERAGE_COLUMNS.len());
                assert_eq!(rows.len(), 2);
                // InsurerX: 20% of 55 = 11.00, within the 5-25 band
                assert_eq!(rows[0][0], Cell::Text("InsurerX".into()));
                assert_eq!(rows[0][1], Cell::Number(2.0));
                assert_eq!(rows[0][4], Cell::Number(11.0));
                assert_eq!(rows[0][5], Cell::Number(55.0));
                // InsurerY: flat copay, open-ended
                assert_eq!(rows[1][4], Cell::Number(5.0));
                assert_eq!(rows[1][7], Cell::Empty);
            }
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn test_coverage_prices_with_cost_known_at_as_of() {
        let result = run(
            ResolvedIntent::new(IntentTag::CoverageLookup)
                .with(ParamKey::Drugs, drugs(&["DrugA"]))
                .with(ParamKey::AsOf, date(2024, 1, 31)),
        )
        .unwrap();

        // The February price of 55 is not yet observed on 2024-01-31
        match &result.value {
            ResultValue::Table { rows, .. } => {
                assert_eq!(rows[0][0], Cell::Text("InsurerX".into()));
                assert_eq!(rows[0][4], Cell::Number(10.0));
                assert_eq!(rows[0][5], Cell::Number(50.0));
            }
            other => panic!("expected table, got {:?}", other),
        }
        assert!(result.provenance.sources.iter().any(|s| s.value == Some(50.0)));
        assert!(!result.provenance.sources.iter().any(|s| s.value == Some(55.0)));
    }

    #[test]
    fn test_tier_scalar_after_formulary_change() {
        let result = run(
            ResolvedIntent::new(IntentTag::TierLookup)
                .with(ParamKey::Drugs, drugs(&["DrugA"]))
                .with(ParamKey::Insurer, ParamValue::Insurer(InsurerId::new("InsurerX")))
                .with(ParamKey::AsOf, date(2024, 8, 1)),
        )
        .unwrap();

        assert!(matches!(
            result.value,
            ResultValue::Scalar { value, unit: Unit::Tier, .. } if value == 3.0
        ));
    }

    #[test]
    fn test_tier_table_without_insurer() {
        let result = run(
            ResolvedIntent::new(IntentTag::TierLookup)
                .with(ParamKey::Drugs, drugs(&["DrugA"]))
                .with(ParamKey::AsOf, date(2024, 3, 1)),
        )
        .unwrap();
        assert!(matches!(result.value, ResultValue::Table { ref rows, .. } if rows.len() == 2));
    }

    #[test]
    fn test_coverage_outside_effective_range_is_no_data() {
        let err = run(
            ResolvedIntent::new(IntentTag::CoverageLookup)
                .with(ParamKey::Drugs, drugs(&["DrugA"]))
                .with(ParamKey::AsOf, date(2023, 6, 1)),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::NoMatchingData { .. }));
    }

    #[test]
    fn test_execution_is_repeatable() {
        let intent = ResolvedIntent::new(IntentTag::CostTrend).with(ParamKey::Drugs, drugs(&["DrugB"]));
        assert_eq!(run(intent.clone()).unwrap(), run(intent).unwrap());
    }
}
