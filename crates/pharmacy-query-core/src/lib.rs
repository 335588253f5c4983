//! Pharmacy Query Core Library
//!
//! Answers free-form questions about medication prices, insurance coverage
//! and formulary tiers with figures computed from the loaded dataset.
//!
//! # Architecture
//!
//! ```text
//! Question → Intent Resolver (model classifier) → ResolvedIntent
//!                                                     │
//!                                         [Query Cache: canonical intent]
//!                                                     │
//!                                      Query Planner → Execution Engine
//!                                                     │
//!                                     ┌───────────────▼───────────────┐
//!                                     │        Answer Composer        │
//!                                     │  model phrasing, then check   │
//!                                     │  every number against result  │
//!                                     └───────────────┬───────────────┘
//!                                                     │
//!                                     grounded text + result + provenance
//! ```
//!
//! # Core Principle
//!
//! **Numbers come from the dataset, never from the model.** The model picks
//! the query and phrases the answer; any phrasing that states a figure the
//! result does not contain is replaced by a mechanical rendering.
//!
//! # Modules
//!
//! - [`dataset`]: Dataset Model (load, alias lookup, fingerprint)
//! - [`models`]: Domain types (records, intents, results, sessions)
//! - [`resolver`]: Intent Resolver (classifier call + disambiguation)
//! - [`planner`]: Query Planner
//! - [`executor`]: Execution Engine
//! - [`composer`]: Answer Composer with grounding check
//! - [`cache`]: Query Cache with in-flight deduplication
//! - [`db`]: SQLite persistence for cached results
//! - [`engine`]: `QueryEngine` facade

pub mod cache;
pub mod composer;
pub mod config;
pub mod dataset;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod models;
pub mod planner;
pub mod resolver;

// Re-export commonly used types
pub use cache::{CacheOutcome, CacheStats, QueryCache};
pub use composer::{AnswerComposer, AnswerSource};
pub use config::{Backend, EngineConfig};
pub use dataset::{DatasetError, DatasetModel, RawRow};
pub use db::Database;
pub use engine::{Answer, EngineError, Outcome, QueryEngine};
pub use error::{QueryError, QueryResult};
pub use models::{ExecutionResult, IntentTag, Provenance, ResolvedIntent, ResultValue, SessionContext};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum PharmacyQueryCoreError {
    #[error("Dataset error: {0}")]
    DatasetError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<DatasetError> for PharmacyQueryCoreError {
    fn from(e: DatasetError) -> Self {
        PharmacyQueryCoreError::DatasetError(e.to_string())
    }
}

impl From<db::DbError> for PharmacyQueryCoreError {
    fn from(e: db::DbError) -> Self {
        PharmacyQueryCoreError::StorageError(e.to_string())
    }
}

impl From<config::ConfigError> for PharmacyQueryCoreError {
    fn from(e: config::ConfigError) -> Self {
        PharmacyQueryCoreError::ConfigError(e.to_string())
    }
}

impl From<EngineError> for PharmacyQueryCoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Dataset(e) => e.into(),
            EngineError::Store(e) => e.into(),
            EngineError::Config(e) => e.into(),
            EngineError::Model(e) => PharmacyQueryCoreError::ModelError(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for PharmacyQueryCoreError {
    fn from(e: serde_json::Error) -> Self {
        PharmacyQueryCoreError::SerializationError(e.to_string())
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

fn engine_config(config_json: Option<String>) -> Result<EngineConfig, PharmacyQueryCoreError> {
    Ok(match config_json {
        Some(json) => EngineConfig::from_json_str(&json)?,
        None => EngineConfig::from_env()?,
    })
}

/// Load a JSON array of row objects and open an engine over it.
///
/// `config_json` is an `EngineConfig` document; without it the
/// `PHARMACY_QUERY_*` environment applies.
#[uniffi::export]
pub fn open_engine(
    rows_json: String,
    config_json: Option<String>,
) -> Result<Arc<PharmacyQueryCore>, PharmacyQueryCoreError> {
    let rows = dataset::rows_from_json(&rows_json)?;
    let dataset = DatasetModel::load(&rows)?;
    let config = engine_config(config_json)?;
    Ok(Arc::new(PharmacyQueryCore {
        engine: QueryEngine::from_config(dataset, &config)?,
    }))
}

/// Open an engine over the built-in sample formulary (for demos).
#[uniffi::export]
pub fn open_sample_engine(config_json: Option<String>) -> Result<Arc<PharmacyQueryCore>, PharmacyQueryCoreError> {
    let dataset = dataset::sample::sample_dataset()?;
    let config = engine_config(config_json)?;
    Ok(Arc::new(PharmacyQueryCore {
        engine: QueryEngine::from_config(dataset, &config)?,
    }))
}

// =========================================================================
// Main API Object
// =========================================================================

/// Thread-safe engine wrapper for FFI.
#[derive(uniffi::Object)]
pub struct PharmacyQueryCore {
    engine: QueryEngine,
}

#[uniffi::export]
impl PharmacyQueryCore {
    /// Fresh session with no defaults.
    pub fn new_session(&self) -> FfiSession {
        SessionContext::new().into()
    }

    /// Answer a question. Query failures come back as non-answered outcomes.
    pub fn ask(&self, question: String, session: FfiSession) -> Result<FfiAnswer, PharmacyQueryCoreError> {
        let session = SessionContext::try_from(session)?;
        let answer = self.engine.ask(&question, &session);
        FfiAnswer::try_from(answer)
    }

    /// Full `Answer` as JSON, including the typed result.
    pub fn ask_json(&self, question: String, session: FfiSession) -> Result<String, PharmacyQueryCoreError> {
        let session = SessionContext::try_from(session)?;
        let answer = self.engine.ask(&question, &session);
        Ok(serde_json::to_string(&answer)?)
    }

    /// Replace the dataset. Returns the new dataset version.
    pub fn reload(&self, rows_json: String) -> Result<u64, PharmacyQueryCoreError> {
        let rows = dataset::rows_from_json(&rows_json)?;
        Ok(self.engine.reload(&rows)?)
    }

    pub fn summary(&self) -> FfiDatasetSummary {
        self.engine.summary().into()
    }

    pub fn stats(&self) -> FfiEngineStats {
        self.engine.stats().into()
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe session defaults. Dates are `YYYY-MM-DD`.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSession {
    pub session_id: String,
    pub default_insurer: Option<String>,
    pub as_of: Option<String>,
}

impl From<SessionContext> for FfiSession {
    fn from(session: SessionContext) -> Self {
        Self {
            session_id: session.session_id.to_string(),
            default_insurer: session.default_insurer,
            as_of: session.as_of.map(|d| d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl TryFrom<FfiSession> for SessionContext {
    type Error = PharmacyQueryCoreError;

    fn try_from(session: FfiSession) -> Result<Self, Self::Error> {
        let session_id = Uuid::parse_str(&session.session_id)
            .map_err(|e| PharmacyQueryCoreError::InvalidInput(format!("session_id: {}", e)))?;
        let as_of = session
            .as_of
            .as_deref()
            .map(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| PharmacyQueryCoreError::InvalidInput(format!("as_of: `{}`", raw)))
            })
            .transpose()?;
        Ok(SessionContext {
            session_id,
            default_insurer: session.default_insurer.filter(|i| !i.trim().is_empty()),
            as_of,
        })
    }
}

/// FFI-safe answer. The typed result travels as JSON.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAnswer {
    pub text: String,
    /// answered, no_data, needs_clarification, needs_disambiguation, needs_detail
    pub outcome: String,
    /// Candidate drug names when the outcome is needs_disambiguation
    pub candidates: Vec<String>,
    pub intent: Option<String>,
    pub result_json: Option<String>,
    pub source_record_ids: Vec<String>,
    pub filters: Vec<String>,
    pub excluded_missing: u32,
    pub model_phrased: bool,
    pub from_cache: bool,
    pub related_questions: Vec<String>,
    pub dataset_version: u64,
}

impl TryFrom<Answer> for FfiAnswer {
    type Error = PharmacyQueryCoreError;

    fn try_from(answer: Answer) -> Result<Self, Self::Error> {
        let (outcome, candidates) = match answer.outcome {
            Outcome::Answered => ("answered", Vec::new()),
            Outcome::NoData => ("no_data", Vec::new()),
            Outcome::NeedsClarification => ("needs_clarification", Vec::new()),
            Outcome::NeedsDisambiguation { candidates } => ("needs_disambiguation", candidates),
            Outcome::NeedsDetail => ("needs_detail", Vec::new()),
        };
        let result_json = answer.result.as_ref().map(serde_json::to_string).transpose()?;
        let provenance = answer.provenance.unwrap_or_default();

        Ok(Self {
            text: answer.text,
            outcome: outcome.to_string(),
            candidates,
            intent: answer.intent.map(|i| i.canonical()),
            result_json,
            source_record_ids: provenance.record_ids().iter().map(|id| id.to_string()).collect(),
            filters: provenance.filters,
            excluded_missing: provenance.excluded_missing as u32,
            model_phrased: answer.answer_source == AnswerSource::Model,
            from_cache: matches!(answer.cache, Some(CacheOutcome::Hit) | Some(CacheOutcome::Shared)),
            related_questions: answer.related_questions,
            dataset_version: answer.dataset_version,
        })
    }
}

/// FFI-safe dataset summary.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiDatasetSummary {
    pub drug_count: u32,
    pub insurers: Vec<String>,
    pub medication_records: u32,
    pub coverage_records: u32,
    pub missing_costs: u32,
    pub mean_latest_unit_cost: Option<f64>,
    pub drugs_with_generic: u32,
    pub by_insurer: Vec<FfiInsurerSummary>,
}

/// FFI-safe coverage breakdown for one insurer.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiInsurerSummary {
    pub insurer: String,
    pub coverage_records: u32,
    pub covered: u32,
    pub prior_authorization: u32,
    pub step_therapy: u32,
    pub not_covered: u32,
    pub min_copay: Option<f64>,
    pub max_copay: Option<f64>,
    pub mean_coinsurance_pct: Option<f64>,
}

impl From<dataset::InsurerSummary> for FfiInsurerSummary {
    fn from(summary: dataset::InsurerSummary) -> Self {
        Self {
            insurer: summary.insurer,
            coverage_records: summary.coverage_records as u32,
            covered: summary.covered as u32,
            prior_authorization: summary.prior_authorization as u32,
            step_therapy: summary.step_therapy as u32,
            not_covered: summary.not_covered as u32,
            min_copay: summary.min_copay,
            max_copay: summary.max_copay,
            mean_coinsurance_pct: summary.mean_coinsurance_pct,
        }
    }
}

impl From<dataset::DatasetSummary> for FfiDatasetSummary {
    fn from(summary: dataset::DatasetSummary) -> Self {
        Self {
            drug_count: summary.drug_count as u32,
            insurers: summary.insurers,
            medication_records: summary.medication_records as u32,
            coverage_records: summary.coverage_records as u32,
            missing_costs: summary.missing_costs as u32,
            mean_latest_unit_cost: summary.mean_latest_unit_cost,
            drugs_with_generic: summary.drugs_with_generic as u32,
            by_insurer: summary.by_insurer.into_iter().map(Into::into).collect(),
        }
    }
}

/// FFI-safe engine statistics.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiEngineStats {
    pub dataset_version: u64,
    pub fingerprint: String,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub computations: u64,
    pub shared: u64,
    pub cache_entries: u32,
}

impl From<engine::EngineStats> for FfiEngineStats {
    fn from(stats: engine::EngineStats) -> Self {
        Self {
            dataset_version: stats.dataset_version,
            fingerprint: stats.fingerprint,
            cache_hits: stats.cache.hits,
            cache_misses: stats.cache.misses,
            computations: stats.cache.computations,
            shared: stats.cache.shared,
            cache_entries: stats.cache.entries as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYWORD: &str = r#"{"llm":{"backend":"keyword"}}"#;

    #[test]
    fn test_open_sample_engine_and_ask() {
        let core = open_sample_engine(Some(KEYWORD.to_string())).unwrap();
        let session = core.new_session();

        let answer = core
            .ask("What is the price trend for Lipitor?".into(), session)
            .unwrap();
        assert_eq!(answer.outcome, "answered");
        assert_eq!(answer.intent.as_deref(), Some("COST_TREND|drugs=[lipitor]"));
        assert!(answer.text.contains("increasing"), "{}", answer.text);
        assert_eq!(answer.source_record_ids.len(), 3);
        assert!(!answer.model_phrased);
    }

    #[test]
    fn test_open_engine_from_json_rows() {
        let rows = r#"[
            {"drug_name":"DrugA","unit_cost":50,"price_date":"2024-01-10"},
            {"drug_name":"DrugA","unit_cost":55,"price_date":"2024-02-10"}
        ]"#;
        let core = open_engine(rows.into(), Some(KEYWORD.into())).unwrap();
        assert_eq!(core.summary().medication_records, 2);

        let version = core
            .reload(r#"[{"drug_name":"DrugB","unit_cost":"40","price_date":"2024-02-01"}]"#.into())
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(core.stats().dataset_version, 2);
    }

    #[test]
    fn test_bad_inputs() {
        assert!(matches!(
            open_engine("not json".into(), Some(KEYWORD.into())),
            Err(PharmacyQueryCoreError::DatasetError(_))
        ));
        assert!(matches!(
            open_sample_engine(Some("{".into())),
            Err(PharmacyQueryCoreError::ConfigError(_))
        ));

        let core = open_sample_engine(Some(KEYWORD.into())).unwrap();
        let mut session = core.new_session();
        session.as_of = Some("March".into());
        assert!(matches!(
            core.ask("Is Lipitor covered?".into(), session),
            Err(PharmacyQueryCoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_disambiguation_outcome_carries_candidates() {
        let rows = r#"[
            {"drug_name":"Metoprolol Tartrate","unit_cost":1,"price_date":"2024-01-01"},
            {"drug_name":"Metoprolol Succinate","unit_cost":2,"price_date":"2024-01-01"}
        ]"#;
        let core = open_engine(rows.into(), Some(KEYWORD.into())).unwrap();
        let answer = core
            .ask("How much does Metoprolol cost?".into(), core.new_session())
            .unwrap();
        assert_eq!(answer.outcome, "needs_disambiguation");
        assert_eq!(answer.candidates, vec!["Metoprolol Succinate", "Metoprolol Tartrate"]);
    }
}
