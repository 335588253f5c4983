//! Query-cycle error taxonomy.

use thiserror::Error;

use crate::models::IntentTag;

/// Failures of a single question. Cloneable so a deduplicated computation
/// can hand the same error to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// The question maps to no supported intent, names an unknown drug, or
    /// the classifier could not be reached.
    #[error("could not resolve question: {reason}")]
    IntentUnresolved { reason: String },

    #[error("`{mention}` matches several drugs: {}", candidates.join(", "))]
    AmbiguousEntity {
        mention: String,
        /// Sorted display names
        candidates: Vec<String>,
    },

    #[error("{intent} needs {detail}")]
    UnsupportedParameters { intent: IntentTag, detail: String },

    #[error("no data matches {}", filters.join("; "))]
    NoMatchingData { filters: Vec<String> },

    /// Model text stated figures absent from the result. Recovered by the
    /// template and never shown to users.
    #[error("answer mentions values not in the result: {}", tokens.join(", "))]
    UngroundedAnswer { tokens: Vec<String> },
}

impl QueryError {
    pub fn unresolved(reason: impl Into<String>) -> Self {
        QueryError::IntentUnresolved {
            reason: reason.into(),
        }
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
