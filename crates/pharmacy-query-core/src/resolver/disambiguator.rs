//! Drug mention disambiguation.
//!
//! Resolution order: exact name or alias, then the longest partial match,
//! then fuzzy similarity. A tie at whichever stage decides is ambiguous.

use std::collections::BTreeSet;

use strsim::{jaro_winkler, normalized_levenshtein};

use crate::dataset::DatasetModel;
use crate::error::{QueryError, QueryResult};
use crate::models::{normalize_name, DrugId};

/// Shortest overlap accepted as a partial match.
const MIN_PARTIAL_LEN: usize = 3;

/// Minimum similarity for a fuzzy match.
const FUZZY_THRESHOLD: f64 = 0.85;

/// Scores closer than this are a tie.
const SCORE_EPSILON: f64 = 1e-9;

/// How a mention was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Exact,
    Partial,
    Fuzzy,
}

/// Maps free-text drug mentions onto canonical ids.
pub struct Disambiguator<'a> {
    dataset: &'a DatasetModel,
}

impl<'a> Disambiguator<'a> {
    pub fn new(dataset: &'a DatasetModel) -> Self {
        Self { dataset }
    }

    /// Resolve one mention to a single drug.
    pub fn resolve(&self, mention: &str) -> QueryResult<(DrugId, MatchMethod)> {
        let query = normalize_name(mention);
        if query.is_empty() {
            return Err(QueryError::unresolved("empty drug name"));
        }

        if let Some(drug) = self.dataset.canonical_id(&query) {
            return Ok((drug.clone(), MatchMethod::Exact));
        }

        if let Some(candidates) = self.partial_matches(&query) {
            return self.single(mention, candidates, MatchMethod::Partial);
        }

        if let Some(candidates) = self.fuzzy_matches(&query) {
            return self.single(mention, candidates, MatchMethod::Fuzzy);
        }

        Err(QueryError::unresolved(format!("unknown drug `{}`", mention.trim())))
    }

    /// Drugs sharing the longest overlap with the query.
    fn partial_matches(&self, query: &str) -> Option<BTreeSet<DrugId>> {
        let mut best = 0;
        let mut candidates = BTreeSet::new();

        for (name, drug) in self.dataset.names() {
            let overlap = if name.contains(query) {
                query.len()
            } else if query.contains(name.as_str()) {
                name.len()
            } else {
                continue;
            };
            if overlap < MIN_PARTIAL_LEN {
                continue;
            }
            if overlap > best {
                best = overlap;
                candidates.clear();
            }
            if overlap == best {
                candidates.insert(drug.clone());
            }
        }

        (!candidates.is_empty()).then_some(candidates)
    }

    /// Drugs with the highest similarity above the threshold.
    fn fuzzy_matches(&self, query: &str) -> Option<BTreeSet<DrugId>> {
        let mut best = FUZZY_THRESHOLD;
        let mut candidates = BTreeSet::new();

        for (name, drug) in self.dataset.names() {
            let score = fuzzy_match(query, name);
            if score + SCORE_EPSILON < best {
                continue;
            }
            if score > best + SCORE_EPSILON {
                best = score;
                candidates.clear();
            }
            candidates.insert(drug.clone());
        }

        (!candidates.is_empty()).then_some(candidates)
    }

    fn single(
        &self,
        mention: &str,
        candidates: BTreeSet<DrugId>,
        method: MatchMethod,
    ) -> QueryResult<(DrugId, MatchMethod)> {
        if candidates.len() == 1 {
            if let Some(drug) = candidates.into_iter().next() {
                tracing::debug!(mention, drug = %drug, ?method, "drug mention resolved");
                return Ok((drug, method));
            }
            return Err(QueryError::unresolved(format!("unknown drug `{}`", mention.trim())));
        }

        let mut names: Vec<String> = candidates
            .iter()
            .map(|d| self.dataset.drug_display(d))
            .collect();
        names.sort();
        Err(QueryError::AmbiguousEntity {
            mention: mention.trim().to_string(),
            candidates: names,
        })
    }
}

/// Combined string similarity in `[0, 1]`.
pub fn fuzzy_match(a: &str, b: &str) -> f64 {
    // Jaro-Winkler rewards shared prefixes, Levenshtein overall edit distance
    let jw = jaro_winkler(a, b);
    let lev = normalized_levenshtein(a, b);
    jw * 0.6 + lev * 0.4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fixtures::{row, scenario_dataset};

    #[test]
    fn test_exact_name_and_alias() {
        let dataset = scenario_dataset();
        let resolver = Disambiguator::new(&dataset);

        assert_eq!(
            resolver.resolve("DRUGA").unwrap(),
            (DrugId::new("druga"), MatchMethod::Exact)
        );
        assert_eq!(
            resolver.resolve("alphacor").unwrap(),
            (DrugId::new("druga"), MatchMethod::Exact)
        );
    }

    #[test]
    fn test_longest_partial_match_wins() {
        let dataset = scenario_dataset();
        let resolver = Disambiguator::new(&dataset);

        // Known alias inside a longer mention
        let (drug, method) = resolver.resolve("alphacor 20mg").unwrap();
        assert_eq!(drug, DrugId::new("druga"));
        assert_eq!(method, MatchMethod::Partial);

        // "drugab" (6) is longer than "druga" (5)
        let (drug, _) = resolver.resolve("drugab tablets").unwrap();
        assert_eq!(drug, DrugId::new("drugab"));
    }

    #[test]
    fn test_partial_tie_is_ambiguous() {
        let dataset = DatasetModel::load(&[
            row(&[("drug_name", "Metoprolol Tartrate"), ("price_date", "2024-01-01")]),
            row(&[("drug_name", "Metoprolol Succinate"), ("price_date", "2024-01-01")]),
            row(&[("drug_name", "Lisinopril"), ("price_date", "2024-01-01")]),
        ])
        .unwrap();
        let resolver = Disambiguator::new(&dataset);

        let err = resolver.resolve("metoprolol").unwrap_err();
        assert_eq!(
            err,
            QueryError::AmbiguousEntity {
                mention: "metoprolol".into(),
                candidates: vec!["Metoprolol Succinate".into(), "Metoprolol Tartrate".into()],
            }
        );
    }

    #[test]
    fn test_fuzzy_typo() {
        let dataset = DatasetModel::load(&[
            row(&[("drug_name", "Lisinopril"), ("price_date", "2024-01-01")]),
            row(&[("drug_name", "Metformin"), ("price_date", "2024-01-01")]),
        ])
        .unwrap();
        let resolver = Disambiguator::new(&dataset);

        let (drug, method) = resolver.resolve("lisinoprl").unwrap();
        assert_eq!(drug, DrugId::new("lisinopril"));
        assert_eq!(method, MatchMethod::Fuzzy);
    }

    #[test]
    fn test_unknown_drug() {
        let dataset = scenario_dataset();
        let resolver = Disambiguator::new(&dataset);

        let err = resolver.resolve("Zorblax").unwrap_err();
        assert!(matches!(err, QueryError::IntentUnresolved { ref reason } if reason.contains("Zorblax")));
    }

    #[test]
    fn test_short_overlap_is_ignored() {
        let dataset = scenario_dataset();
        let resolver = Disambiguator::new(&dataset);
        assert!(resolver.resolve("dr").is_err());
    }

    #[test]
    fn test_fuzzy_match() {
        assert!(fuzzy_match("lisinopril", "lisinopril") > 0.99);
        assert!(fuzzy_match("lisinopril", "lisinoprl") > 0.85);
        assert!(fuzzy_match("lisinopril", "metformin") < 0.5);
    }
}
