//! Query engine facade: one question cycle end to end.
//!
//! ```text
//! question → IntentResolver → ResolvedIntent ─┬─ cache hit ──────────────┐
//!                                             └─ plan → execute → store ─┤
//!                                                                        ▼
//!                                                   AnswerComposer → Answer
//! ```
//!
//! Sessions share one dataset snapshot and one cache. A reload takes the
//! dataset write lock, so it waits for every in-flight question on the old
//! snapshot, then swaps it and invalidates the cache.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use chrono::{NaiveDate, Utc};
use pharmacy_query_llm::{KeywordClassifier, LanguageModel, ModelError, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheOutcome, CacheStats, QueryCache, SingleFlight};
use crate::composer::{related_questions, AnswerComposer, AnswerSource};
use crate::config::{Backend, ConfigError, EngineConfig};
use crate::dataset::{DatasetError, DatasetModel, DatasetSummary, RawRow};
use crate::db::{Database, DbError};
use crate::error::{QueryError, QueryResult};
use crate::executor::execute;
use crate::models::{normalize_name, ExecutionResult, Provenance, ResolvedIntent, SessionContext};
use crate::planner::plan;
use crate::resolver::IntentResolver;

/// Failures outside a single question.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Cache store error: {0}")]
    Store(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model backend error: {0}")]
    Model(#[from] ModelError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// How the question cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    /// Filters matched nothing
    NoData,
    /// The question could not be mapped to a supported query
    NeedsClarification,
    /// A drug mention matched several drugs
    NeedsDisambiguation { candidates: Vec<String> },
    /// The intent is known but a required parameter is missing
    NeedsDetail,
}

/// What `ask` returns to a front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    pub text: String,
    pub outcome: Outcome,
    pub intent: Option<ResolvedIntent>,
    pub result: Option<ExecutionResult>,
    pub provenance: Option<Provenance>,
    pub answer_source: AnswerSource,
    pub cache: Option<CacheOutcome>,
    pub related_questions: Vec<String>,
    pub dataset_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub dataset_version: u64,
    pub fingerprint: String,
    pub cache: CacheStats,
}

/// The dataset in force and the version it was installed at.
pub struct DatasetSnapshot {
    pub dataset: DatasetModel,
    pub version: u64,
}

/// Identical questions in flight share one classification.
type ResolveKey = (u64, String, Option<String>, Option<NaiveDate>);

pub struct QueryEngine {
    dataset: RwLock<Arc<DatasetSnapshot>>,
    cache: QueryCache,
    resolving: SingleFlight<ResolveKey, QueryResult<ResolvedIntent>>,
    resolver: IntentResolver,
    composer: AnswerComposer,
    today: Option<NaiveDate>,
}

impl QueryEngine {
    /// Engine with an in-memory cache and the default retry policy.
    pub fn new(dataset: DatasetModel, model: Arc<dyn LanguageModel>) -> Self {
        let cache = QueryCache::new(dataset.fingerprint(), None);
        Self::assemble(dataset, model, RetryPolicy::default(), true, cache)
    }

    /// Engine wired from `config` around a caller-supplied model.
    pub fn with_model(dataset: DatasetModel, model: Arc<dyn LanguageModel>, config: &EngineConfig) -> EngineResult<Self> {
        let mut cache = QueryCache::new(dataset.fingerprint(), config.cache.max_entries);
        if let Some(path) = &config.cache.path {
            cache = cache.with_store(Database::open(path)?);
        }
        Ok(Self::assemble(
            dataset,
            model,
            config.llm.retry_policy(),
            config.llm.include_examples,
            cache,
        ))
    }

    /// Engine wired from `config`, including the model backend.
    pub fn from_config(dataset: DatasetModel, config: &EngineConfig) -> EngineResult<Self> {
        let model: Arc<dyn LanguageModel> = match config.llm.backend {
            Backend::Ollama => Arc::new(pharmacy_query_llm::OllamaClient::new(
                &config.llm.base_url,
                &config.llm.model,
                config.llm.timeout(),
            )?),
            Backend::Keyword => Arc::new(KeywordClassifier::new()),
        };
        Self::with_model(dataset, model, config)
    }

    fn assemble(
        dataset: DatasetModel,
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        include_examples: bool,
        cache: QueryCache,
    ) -> Self {
        let version = cache.version();
        tracing::info!(
            version,
            fingerprint = dataset.fingerprint(),
            model = model.name(),
            "query engine ready"
        );
        Self {
            dataset: RwLock::new(Arc::new(DatasetSnapshot { dataset, version })),
            cache,
            resolving: SingleFlight::new(),
            resolver: IntentResolver::new(Arc::clone(&model), retry.clone()).with_examples(include_examples),
            composer: AnswerComposer::new(model, retry),
            today: None,
        }
    }

    /// Pin the date used when a question needs "today".
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn snapshot(&self) -> RwLockReadGuard<'_, Arc<DatasetSnapshot>> {
        self.dataset.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer a question, turning every query error into a user-facing reply.
    pub fn ask(&self, question: &str, session: &SessionContext) -> Answer {
        match self.try_ask(question, session) {
            Ok(answer) => answer,
            Err(e) => self.reply_to_error(question, e),
        }
    }

    /// Answer a question, surfacing query errors.
    pub fn try_ask(&self, question: &str, session: &SessionContext) -> QueryResult<Answer> {
        let span = tracing::info_span!("ask", session = %session.session_id);
        let _entered = span.enter();

        let snapshot = self.snapshot();
        let intent = self.resolve_in(&snapshot, question, session)?;
        let key = intent.canonical();

        let (result, outcome) = self.cache.get_or_compute(&key, || {
            let plan = plan(&intent)?;
            execute(&plan, &snapshot.dataset)
        })?;
        tracing::info!(key = %key, cache = ?outcome, version = snapshot.version, "query executed");

        let composed = self.composer.compose(question, &result);
        Ok(Answer {
            question: question.to_string(),
            text: composed.text,
            outcome: Outcome::Answered,
            related_questions: related_questions(&intent, &snapshot.dataset),
            intent: Some(intent),
            provenance: Some(result.provenance.clone()),
            result: Some(result),
            answer_source: composed.source,
            cache: Some(outcome),
            dataset_version: snapshot.version,
        })
    }

    /// Resolve a question without executing it.
    pub fn resolve(&self, question: &str, session: &SessionContext) -> QueryResult<ResolvedIntent> {
        let snapshot = self.snapshot();
        self.resolve_in(&snapshot, question, session)
    }

    fn resolve_in(
        &self,
        snapshot: &DatasetSnapshot,
        question: &str,
        session: &SessionContext,
    ) -> QueryResult<ResolvedIntent> {
        let key: ResolveKey = (
            snapshot.version,
            normalize_name(question),
            session.default_insurer.clone(),
            session.as_of,
        );
        let today = self.today();
        let (intent, _) = self.resolving.run(&key, || {
            self.resolver.resolve(question, &snapshot.dataset, session, today)
        });
        intent
    }

    /// Load `rows` and swap them in. Returns the new dataset version.
    pub fn reload(&self, rows: &[RawRow]) -> EngineResult<u64> {
        let dataset = DatasetModel::load(rows)?;
        Ok(self.replace_dataset(dataset))
    }

    /// Swap in an already-loaded dataset. Waits for in-flight questions.
    pub fn replace_dataset(&self, dataset: DatasetModel) -> u64 {
        let mut current = self.dataset.write().unwrap_or_else(PoisonError::into_inner);
        let version = self.cache.invalidate(dataset.fingerprint());
        tracing::info!(
            version,
            fingerprint = dataset.fingerprint(),
            medications = dataset.medication_count(),
            coverage = dataset.coverage_count(),
            "dataset reloaded"
        );
        *current = Arc::new(DatasetSnapshot { dataset, version });
        version
    }

    /// Current dataset, shared.
    pub fn dataset(&self) -> Arc<DatasetSnapshot> {
        Arc::clone(&self.snapshot())
    }

    pub fn summary(&self) -> DatasetSummary {
        self.snapshot().dataset.summary()
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.snapshot();
        EngineStats {
            dataset_version: snapshot.version,
            fingerprint: snapshot.dataset.fingerprint().to_string(),
            cache: self.cache.stats(),
        }
    }

    fn reply_to_error(&self, question: &str, error: QueryError) -> Answer {
        let (outcome, text) = match &error {
            QueryError::IntentUnresolved { reason } => (
                Outcome::NeedsClarification,
                format!(
                    "I couldn't work out the question ({}). Try naming a drug and asking about its price, \
                     price trend, insurance coverage or formulary tier.",
                    reason
                ),
            ),
            QueryError::AmbiguousEntity { mention, candidates } => (
                Outcome::NeedsDisambiguation {
                    candidates: candidates.clone(),
                },
                format!(
                    "\"{}\" matches more than one drug: {}. Which one did you mean?",
                    mention,
                    candidates.join(", ")
                ),
            ),
            QueryError::UnsupportedParameters { detail, .. } => (
                Outcome::NeedsDetail,
                format!("To answer that I need {}.", detail),
            ),
            QueryError::NoMatchingData { filters } => (
                Outcome::NoData,
                format!("No matching data was found ({}).", filters.join("; ")),
            ),
            QueryError::UngroundedAnswer { .. } => (
                Outcome::NeedsClarification,
                "The answer could not be verified against the data.".to_string(),
            ),
        };
        tracing::info!(error = %error, "question not answered");

        Answer {
            question: question.to_string(),
            text,
            outcome,
            intent: None,
            result: None,
            provenance: None,
            answer_source: AnswerSource::Template,
            cache: None,
            related_questions: Vec::new(),
            dataset_version: self.snapshot().version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fixtures::{row, scenario_dataset, scenario_rows};
    use crate::models::{ResultValue, SeriesPoint};
    use pharmacy_query_llm::{ModelTask, ScriptedModel};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn keyword_engine() -> QueryEngine {
        QueryEngine::new(scenario_dataset(), Arc::new(KeywordClassifier::new())).with_today(today())
    }

    #[test]
    fn test_trend_answer() {
        let engine = keyword_engine();
        let answer = engine.ask("What's the trend for DrugA?", &SessionContext::new());

        assert_eq!(answer.outcome, Outcome::Answered);
        assert_eq!(answer.answer_source, AnswerSource::Template);
        match answer.result.unwrap().value {
            ResultValue::TimeSeries { points, .. } => assert_eq!(
                points,
                vec![
                    SeriesPoint { period: "2024-01".into(), value: 50.0 },
                    SeriesPoint { period: "2024-02".into(), value: 55.0 },
                ]
            ),
            other => panic!("expected series, got {:?}", other),
        }
        assert!(answer.text.contains("$50.00"));
        assert!(answer.text.contains("$55.00"));
        assert!(answer.text.contains("increasing"));
        assert!(!answer.related_questions.is_empty());
    }

    #[test]
    fn test_second_ask_hits_cache() {
        let engine = keyword_engine();
        let session = SessionContext::new();
        let first = engine.ask("How much does DrugB cost?", &session);
        let second = engine.ask("how much does drugb cost", &session);

        assert_eq!(first.cache, Some(CacheOutcome::Computed));
        assert_eq!(second.cache, Some(CacheOutcome::Hit));
        assert_eq!(first.result, second.result);
        assert_eq!(engine.stats().cache.computations, 1);
    }

    #[test]
    fn test_errors_become_replies() {
        let engine = keyword_engine();
        let session = SessionContext::new();

        let unknown = engine.ask("How much does Zorblax cost?", &session);
        assert_eq!(unknown.outcome, Outcome::NeedsClarification);
        assert!(unknown.result.is_none());

        let blank = engine.ask("   ", &session);
        assert_eq!(blank.outcome, Outcome::NeedsClarification);
    }

    #[test]
    fn test_model_answer_is_used_when_grounded() {
        let model = ScriptedModel::new()
            .on(ModelTask::ClassifyIntent, r#"{"intent":"COST_COMPARISON","drugs":["DrugA","DrugB"]}"#)
            .on(ModelTask::ComposeAnswer, "DrugA costs $15.00 more than DrugB ($55.00 vs $40.00).");
        let engine = QueryEngine::new(scenario_dataset(), Arc::new(model)).with_today(today());

        let answer = engine.ask("Compare DrugA and DrugB", &SessionContext::new());
        assert_eq!(answer.answer_source, AnswerSource::Model);
        assert_eq!(answer.provenance.unwrap().sources.len(), 2);
    }

    #[test]
    fn test_reload_bumps_version_and_clears_cache() {
        let engine = keyword_engine();
        let session = SessionContext::new();
        engine.ask("How much does DrugA cost?", &session);
        assert_eq!(engine.cache().len(), 1);

        let mut rows = scenario_rows();
        rows.push(row(&[("drug_name", "DrugA"), ("unit_cost", "60"), ("price_date", "2024-02-20")]));
        let version = engine.reload(&rows).unwrap();

        assert_eq!(version, 2);
        assert!(engine.cache().is_empty());
        let answer = engine.ask("How much does DrugA cost?", &session);
        assert_eq!(answer.dataset_version, 2);
        assert!(answer.text.contains("$60.00"), "{}", answer.text);
    }

    #[test]
    fn test_failed_reload_keeps_dataset() {
        let engine = keyword_engine();
        let before = engine.stats();
        assert!(engine.reload(&[row(&[("aliases", "x")])]).is_err());
        assert_eq!(engine.stats(), before);
    }
}
