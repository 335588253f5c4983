//! Intent Resolver: natural-language question to `ResolvedIntent`.
//!
//! Pipeline: classifier call (with retry) → strict output validation →
//! drug disambiguation → parameter normalization.

mod disambiguator;
mod normalizer;

pub use disambiguator::*;
pub use normalizer::*;

use std::sync::Arc;

use chrono::NaiveDate;
use pharmacy_query_llm::{
    build_classification_prompt, parse_intent_output, ClassificationContext, ClassifiedIntent,
    ExtractionError, LanguageModel, ModelRequest, ModelTask, RetryPolicy, CLASSIFY_SYSTEM_PROMPT,
};

use crate::dataset::DatasetModel;
use crate::error::{QueryError, QueryResult};
use crate::models::{DrugId, IntentTag, ParamKey, ParamValue, ResolvedIntent, SessionContext};

/// Resolves questions through a language-model classifier.
pub struct IntentResolver {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    include_examples: bool,
}

impl IntentResolver {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self {
            model,
            retry,
            include_examples: true,
        }
    }

    /// Toggle few-shot examples in the classification prompt.
    pub fn with_examples(mut self, include: bool) -> Self {
        self.include_examples = include;
        self
    }

    /// Resolve a question against `dataset`.
    ///
    /// `today` fills `as_of` for coverage intents when the session has no
    /// reference date.
    pub fn resolve(
        &self,
        question: &str,
        dataset: &DatasetModel,
        session: &SessionContext,
        today: NaiveDate,
    ) -> QueryResult<ResolvedIntent> {
        if question.trim().is_empty() {
            return Err(QueryError::unresolved("empty question"));
        }

        let classified = self.classify(question, dataset, today)?;
        self.bind(classified, dataset, session, today)
    }

    /// One classifier round trip, retried on transport failures.
    pub fn classify(
        &self,
        question: &str,
        dataset: &DatasetModel,
        today: NaiveDate,
    ) -> QueryResult<ClassifiedIntent> {
        let context = ClassificationContext {
            drug_names: dataset.vocabulary(),
            insurers: dataset.insurer_names(),
            today: today.format("%Y-%m-%d").to_string(),
        };
        let request = ModelRequest {
            task: ModelTask::ClassifyIntent,
            system: CLASSIFY_SYSTEM_PROMPT.to_string(),
            prompt: build_classification_prompt(question, &context, self.include_examples),
            json_output: true,
            temperature: 0.0,
        };

        let (response, attempts) = self
            .retry
            .run("classify_intent", |_| self.model.complete(&request));
        let text = response.map_err(|e| {
            tracing::warn!(model = self.model.name(), attempts, error = %e, "classifier unavailable");
            QueryError::unresolved(format!("classifier unavailable: {}", e))
        })?;

        let classified = parse_intent_output(&text).map_err(|e| match e {
            ExtractionError::NoIntent => {
                QueryError::unresolved("question does not match a supported query")
            }
            other => {
                tracing::warn!(error = %other, "classifier output rejected");
                QueryError::unresolved(format!("invalid classifier output: {}", other))
            }
        })?;

        tracing::info!(intent = %classified.tag, attempts, model = self.model.name(), "intent classified");
        Ok(classified)
    }

    /// Turn validated classifier output into a `ResolvedIntent`.
    pub fn bind(
        &self,
        classified: ClassifiedIntent,
        dataset: &DatasetModel,
        session: &SessionContext,
        today: NaiveDate,
    ) -> QueryResult<ResolvedIntent> {
        let tag = classified.tag;
        let accepted = accepted_slots(tag);
        let mut intent = ResolvedIntent::new(tag);

        let disambiguator = Disambiguator::new(dataset);
        let mut drugs: Vec<DrugId> = Vec::new();
        for mention in &classified.drugs {
            let (drug, _) = disambiguator.resolve(mention)?;
            if !drugs.contains(&drug) {
                drugs.push(drug);
            }
        }
        // A single brand compared on its own means "against its generic"
        if tag == IntentTag::CostComparison && drugs.len() == 1 {
            if let Some(generic) = dataset.generic_of(&drugs[0]) {
                tracing::debug!(brand = %drugs[0], generic = %generic, "comparing with generic equivalent");
                drugs.push(generic.clone());
            }
        }
        if !drugs.is_empty() {
            intent = intent.with(ParamKey::Drugs, ParamValue::Drugs(drugs));
        }

        if accepted.contains(&ParamKey::Insurer) {
            if let Some(raw) = &classified.insurer {
                let insurer = resolve_insurer(dataset, raw)?;
                intent = intent.with(ParamKey::Insurer, ParamValue::Insurer(insurer));
            } else if let Some(default) = &session.default_insurer {
                match dataset.insurer_id(default) {
                    Some(insurer) => {
                        intent = intent.with(ParamKey::Insurer, ParamValue::Insurer(insurer));
                    }
                    None => tracing::debug!(insurer = %default, "session insurer not in dataset"),
                }
            }
        }

        let as_of = classified
            .as_of
            .as_deref()
            .map(|raw| parse_date(ParamKey::AsOf, raw))
            .transpose()?;
        let from = classified
            .from
            .as_deref()
            .map(|raw| parse_date(ParamKey::From, raw))
            .transpose()?;
        let mut to = classified
            .to
            .as_deref()
            .map(|raw| parse_date(ParamKey::To, raw))
            .transpose()?;

        if needs_as_of(tag) {
            let date = as_of.or(session.as_of).unwrap_or(today);
            intent = intent.with(ParamKey::AsOf, ParamValue::Date(date));
        } else if to.is_none() {
            // "cost as of D" reads as the latest price up to D
            to = as_of;
        }

        if accepted.contains(&ParamKey::From) {
            if let (Some(start), Some(end)) = (from, to) {
                if start > end {
                    return Err(QueryError::UnsupportedParameters {
                        intent: tag,
                        detail: format!("a start date on or before {}", end.format("%Y-%m-%d")),
                    });
                }
            }
            if let Some(date) = from {
                intent = intent.with(ParamKey::From, ParamValue::Date(date));
            }
            if let Some(date) = to {
                intent = intent.with(ParamKey::To, ParamValue::Date(date));
            }
        }

        if accepted.contains(&ParamKey::Aggregation) {
            if let Some(aggregation) = classified.aggregation {
                intent = intent.with(ParamKey::Aggregation, ParamValue::Aggregation(aggregation));
            }
        }

        tracing::debug!(canonical = %intent.canonical(), "intent resolved");
        Ok(intent)
    }
}
