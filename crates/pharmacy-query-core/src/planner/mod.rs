//! Query Planner: `ResolvedIntent` → deterministic `QueryPlan`.
//!
//! Plans are pure data. The same intent always yields the same plan, so the
//! canonical intent doubles as the cache key.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};
use crate::models::{Aggregation, DrugId, InsurerId, IntentTag, ParamKey, ResolvedIntent};

/// Record set a plan reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Medications,
    Coverage,
}

/// Row filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    DrugIn { drugs: Vec<DrugId> },
    InsurerIs { insurer: InsurerId },
    /// Inclusive bounds on the observation date
    ObservedBetween {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    EffectiveOn { date: NaiveDate },
}

impl Predicate {
    /// Human-readable form recorded in provenance.
    pub fn describe(&self) -> String {
        match self {
            Predicate::DrugIn { drugs } => {
                let names: Vec<&str> = drugs.iter().map(DrugId::as_str).collect();
                format!("drug in [{}]", names.join(", "))
            }
            Predicate::InsurerIs { insurer } => format!("insurer = {}", insurer),
            Predicate::ObservedBetween { from, to } => match (from, to) {
                (Some(f), Some(t)) => format!("observed {} to {}", iso(*f), iso(*t)),
                (Some(f), None) => format!("observed on or after {}", iso(*f)),
                (None, Some(t)) => format!("observed on or before {}", iso(*t)),
                (None, None) => "any observation date".to_string(),
            },
            Predicate::EffectiveOn { date } => format!("effective on {}", iso(*date)),
        }
    }
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Drug,
    /// Calendar month of the observation (`YYYY-MM`)
    Month,
    Insurer,
}

/// How each group collapses to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "function", rename_all = "snake_case")]
pub enum Reduce {
    Cost(Aggregation),
    /// Keep the coverage record with the latest effective date
    MostRecentlyEffective,
}

/// Final projection into a result shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Finish {
    CostScalar,
    TimeSeries,
    SignedDifference { first: DrugId, second: DrugId },
    CoverageTable,
    TierScalar,
    TierTable,
}

/// filter → group → aggregate → sort → finish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub intent: IntentTag,
    pub source: Source,
    pub predicates: Vec<Predicate>,
    pub group_by: GroupKey,
    pub reduce: Reduce,
    pub sort_by: GroupKey,
    pub finish: Finish,
}

impl QueryPlan {
    pub fn filter_descriptions(&self) -> Vec<String> {
        self.predicates.iter().map(Predicate::describe).collect()
    }

    pub fn drugs(&self) -> &[DrugId] {
        self.predicates
            .iter()
            .find_map(|p| match p {
                Predicate::DrugIn { drugs } => Some(drugs.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

/// Build the plan for an intent.
pub fn plan(intent: &ResolvedIntent) -> QueryResult<QueryPlan> {
    let tag = intent.tag;
    match tag {
        IntentTag::CostLookup => {
            let drug = single_drug(intent)?;
            Ok(QueryPlan {
                intent: tag,
                source: Source::Medications,
                predicates: cost_predicates(vec![drug], intent),
                group_by: GroupKey::Drug,
                reduce: Reduce::Cost(intent.aggregation().unwrap_or(Aggregation::Latest)),
                sort_by: GroupKey::Drug,
                finish: Finish::CostScalar,
            })
        }
        IntentTag::CostTrend => {
            let drug = single_drug(intent)?;
            Ok(QueryPlan {
                intent: tag,
                source: Source::Medications,
                predicates: cost_predicates(vec![drug], intent),
                group_by: GroupKey::Month,
                reduce: Reduce::Cost(Aggregation::Mean),
                sort_by: GroupKey::Month,
                finish: Finish::TimeSeries,
            })
        }
        IntentTag::CostComparison => {
            let drugs = intent.drugs();
            if drugs.len() != 2 {
                return Err(unsupported(tag, "exactly two different drugs to compare"));
            }
            let (first, second) = (drugs[0].clone(), drugs[1].clone());
            Ok(QueryPlan {
                intent: tag,
                source: Source::Medications,
                predicates: cost_predicates(drugs.to_vec(), intent),
                group_by: GroupKey::Drug,
                reduce: Reduce::Cost(Aggregation::Latest),
                sort_by: GroupKey::Drug,
                finish: Finish::SignedDifference { first, second },
            })
        }
        IntentTag::CoverageLookup | IntentTag::TierLookup => {
            let drug = single_drug(intent)?;
            let date = intent
                .date(ParamKey::AsOf)
                .ok_or_else(|| unsupported(tag, "a reference date"))?;

            let mut predicates = vec![Predicate::DrugIn { drugs: vec![drug] }];
            if let Some(insurer) = intent.insurer() {
                predicates.push(Predicate::InsurerIs {
                    insurer: insurer.clone(),
                });
            }
            predicates.push(Predicate::EffectiveOn { date });

            let finish = match (tag, intent.insurer()) {
                (IntentTag::TierLookup, Some(_)) => Finish::TierScalar,
                (IntentTag::TierLookup, None) => Finish::TierTable,
                _ => Finish::CoverageTable,
            };
            Ok(QueryPlan {
                intent: tag,
                source: Source::Coverage,
                predicates,
                group_by: GroupKey::Insurer,
                reduce: Reduce::MostRecentlyEffective,
                sort_by: GroupKey::Insurer,
                finish,
            })
        }
    }
}

fn single_drug(intent: &ResolvedIntent) -> QueryResult<DrugId> {
    match intent.drugs() {
        [drug] => Ok(drug.clone()),
        [] => Err(unsupported(intent.tag, "a drug name")),
        _ => Err(unsupported(intent.tag, "exactly one drug")),
    }
}

fn cost_predicates(drugs: Vec<DrugId>, intent: &ResolvedIntent) -> Vec<Predicate> {
    let mut predicates = vec![Predicate::DrugIn { drugs }];
    let from = intent.date(ParamKey::From);
    let to = intent.date(ParamKey::To);
    if from.is_some() || to.is_some() {
        predicates.push(Predicate::ObservedBetween { from, to });
    }
    predicates
}

fn unsupported(intent: IntentTag, detail: &str) -> QueryError {
    QueryError::UnsupportedParameters {
        intent,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParamValue;

    fn drugs(names: &[&str]) -> ParamValue {
        ParamValue::Drugs(names.iter().map(|n| DrugId::new(n)).collect())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_cost_lookup_defaults_to_latest() {
        let intent = ResolvedIntent::new(IntentTag::CostLookup).with(ParamKey::Drugs, drugs(&["a"]));
        let plan = plan(&intent).unwrap();

        assert_eq!(plan.source, Source::Medications);
        assert_eq!(plan.reduce, Reduce::Cost(Aggregation::Latest));
        assert_eq!(plan.finish, Finish::CostScalar);
        assert_eq!(plan.predicates.len(), 1);
    }

    #[test]
    fn test_trend_groups_by_month() {
        let intent = ResolvedIntent::new(IntentTag::CostTrend)
            .with(ParamKey::Drugs, drugs(&["a"]))
            .with(ParamKey::From, ParamValue::Date(date(2024, 1, 1)));
        let plan = plan(&intent).unwrap();

        assert_eq!(plan.group_by, GroupKey::Month);
        assert_eq!(plan.sort_by, GroupKey::Month);
        assert_eq!(plan.reduce, Reduce::Cost(Aggregation::Mean));
        assert_eq!(
            plan.filter_descriptions(),
            vec!["drug in [a]", "observed on or after 2024-01-01"]
        );
    }

    #[test]
    fn test_comparison_requires_two_drugs() {
        let one = ResolvedIntent::new(IntentTag::CostComparison).with(ParamKey::Drugs, drugs(&["a"]));
        assert!(matches!(
            plan(&one),
            Err(QueryError::UnsupportedParameters {
                intent: IntentTag::CostComparison,
                ..
            })
        ));

        let three = ResolvedIntent::new(IntentTag::CostComparison).with(ParamKey::Drugs, drugs(&["a", "b", "c"]));
        assert!(plan(&three).is_err());

        let two = ResolvedIntent::new(IntentTag::CostComparison).with(ParamKey::Drugs, drugs(&["b", "a"]));
        assert_eq!(
            plan(&two).unwrap().finish,
            Finish::SignedDifference {
                first: DrugId::new("b"),
                second: DrugId::new("a")
            }
        );
    }

    #[test]
    fn test_missing_drug_is_unsupported() {
        let intent = ResolvedIntent::new(IntentTag::CostTrend);
        let err = plan(&intent).unwrap_err();
        assert_eq!(
            err,
            QueryError::UnsupportedParameters {
                intent: IntentTag::CostTrend,
                detail: "a drug name".into()
            }
        );
    }

    #[test]
    fn test_tier_lookup_shape_depends_on_insurer() {
        let base = ResolvedIntent::new(IntentTag::TierLookup)
            .with(ParamKey::Drugs, drugs(&["a"]))
            .with(ParamKey::AsOf, ParamValue::Date(date(2024, 3, 1)));
        assert_eq!(plan(&base).unwrap().finish, Finish::TierTable);

        let with_insurer = base.with(ParamKey::Insurer, ParamValue::Insurer(InsurerId::new("x")));
        let plan = plan(&with_insurer).unwrap();
        assert_eq!(plan.finish, Finish::TierScalar);
        assert_eq!(
            plan.filter_descriptions(),
            vec!["drug in [a]", "insurer = x", "effective on 2024-03-01"]
        );
    }

    #[test]
    fn test_coverage_needs_reference_date() {
        let intent = ResolvedIntent::new(IntentTag::CoverageLookup).with(ParamKey::Drugs, drugs(&["a"]));
        assert!(matches!(plan(&intent), Err(QueryError::UnsupportedParameters { .. })));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let intent = ResolvedIntent::new(IntentTag::CostLookup)
            .with(ParamKey::Aggregation, ParamValue::Aggregation(Aggregation::Min))
            .with(ParamKey::Drugs, drugs(&["a"]));
        assert_eq!(plan(&intent).unwrap(), plan(&intent.clone()).unwrap());
    }
}
