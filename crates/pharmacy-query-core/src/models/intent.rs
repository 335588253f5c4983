//! Resolved query intents.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub use pharmacy_query_llm::{Aggregation, IntentTag};

use super::records::{DrugId, InsurerId};

/// Parameter slot names. Ordering defines the canonical key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKey {
    Aggregation,
    AsOf,
    Drugs,
    From,
    Insurer,
    To,
}

impl ParamKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKey::Aggregation => "aggregation",
            ParamKey::AsOf => "as_of",
            ParamKey::Drugs => "drugs",
            ParamKey::From => "from",
            ParamKey::Insurer => "insurer",
            ParamKey::To => "to",
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Drugs(Vec<DrugId>),
    Insurer(InsurerId),
    Date(NaiveDate),
    Aggregation(Aggregation),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Order is significant for comparisons, so it is kept as given
            ParamValue::Drugs(drugs) => {
                let names: Vec<&str> = drugs.iter().map(DrugId::as_str).collect();
                write!(f, "[{}]", names.join(","))
            }
            ParamValue::Insurer(insurer) => write!(f, "{}", insurer),
            ParamValue::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            ParamValue::Aggregation(agg) => write!(f, "{}", agg),
        }
    }
}

/// An intent tag with its resolved parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIntent {
    pub tag: IntentTag,
    pub params: BTreeMap<ParamKey, ParamValue>,
}

impl ResolvedIntent {
    pub fn new(tag: IntentTag) -> Self {
        Self {
            tag,
            params: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insert.
    pub fn with(mut self, key: ParamKey, value: ParamValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn drugs(&self) -> &[DrugId] {
        match self.params.get(&ParamKey::Drugs) {
            Some(ParamValue::Drugs(drugs)) => drugs,
            _ => &[],
        }
    }

    pub fn insurer(&self) -> Option<&InsurerId> {
        match self.params.get(&ParamKey::Insurer) {
            Some(ParamValue::Insurer(insurer)) => Some(insurer),
            _ => None,
        }
    }

    pub fn date(&self, key: ParamKey) -> Option<NaiveDate> {
        match self.params.get(&key) {
            Some(ParamValue::Date(date)) => Some(*date),
            _ => None,
        }
    }

    pub fn aggregation(&self) -> Option<Aggregation> {
        match self.params.get(&ParamKey::Aggregation) {
            Some(ParamValue::Aggregation(agg)) => Some(*agg),
            _ => None,
        }
    }

    /// Canonical serialization: tag followed by parameters in key order.
    ///
    /// Two intents share a canonical form exactly when they would produce
    /// the same plan.
    pub fn canonical(&self) -> String {
        let mut out = self.tag.as_str().to_string();
        for (key, value) in &self.params {
            out.push('|');
            out.push_str(key.as_str());
            out.push('=');
            out.push_str(&value.to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_is_order_independent() {
        let a = ResolvedIntent::new(IntentTag::CoverageLookup)
            .with(ParamKey::Insurer, ParamValue::Insurer(InsurerId::new("Medicare")))
            .with(ParamKey::Drugs, ParamValue::Drugs(vec![DrugId::new("Lisinopril")]));
        let b = ResolvedIntent::new(IntentTag::CoverageLookup)
            .with(ParamKey::Drugs, ParamValue::Drugs(vec![DrugId::new("lisinopril")]))
            .with(ParamKey::Insurer, ParamValue::Insurer(InsurerId::new("medicare")));

        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), "COVERAGE_LOOKUP|drugs=[lisinopril]|insurer=medicare");
    }

    #[test]
    fn test_canonical_keeps_drug_order() {
        let ab = ResolvedIntent::new(IntentTag::CostComparison).with(
            ParamKey::Drugs,
            ParamValue::Drugs(vec![DrugId::new("a"), DrugId::new("b")]),
        );
        let ba = ResolvedIntent::new(IntentTag::CostComparison).with(
            ParamKey::Drugs,
            ParamValue::Drugs(vec![DrugId::new("b"), DrugId::new("a")]),
        );
        assert_ne!(ab.canonical(), ba.canonical());
    }

    #[test]
    fn test_accessors() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let intent = ResolvedIntent::new(IntentTag::CostLookup)
            .with(ParamKey::From, ParamValue::Date(date))
            .with(ParamKey::Aggregation, ParamValue::Aggregation(Aggregation::Max));

        assert_eq!(intent.date(ParamKey::From), Some(date));
        assert_eq!(intent.date(ParamKey::To), None);
        assert_eq!(intent.aggregation(), Some(Aggregation::Max));
        assert!(intent.drugs().is_empty());
        assert!(intent.insurer().is_none());
    }
}
