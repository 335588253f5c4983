//! Answer Composer: execution result to prose.
//!
//! The model only ever sees the result and its provenance. Its text is used
//! when every number and date in it is backed by the result; otherwise the
//! mechanical template is returned.

mod grounding;
mod suggestions;
mod template;

pub use grounding::*;
pub use suggestions::*;
pub use template::*;

use std::sync::Arc;

use pharmacy_query_llm::{
    make_compose_prompt, LanguageModel, ModelError, ModelRequest, ModelTask, RetryPolicy,
    COMPOSE_SYSTEM_PROMPT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::QueryError;
use crate::models::ExecutionResult;

/// Why model phrasing was not used.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComposeError {
    #[error("Model unavailable: {0}")]
    Model(#[from] ModelError),

    #[error("Result serialization failed: {0}")]
    Serialization(String),

    #[error("Model returned an empty answer")]
    Empty,

    #[error(transparent)]
    Ungrounded(QueryError),
}

pub type ComposeResult<T> = Result<T, ComposeError>;

/// Who wrote the final text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Model,
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedAnswer {
    pub text: String,
    pub source: AnswerSource,
}

pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl AnswerComposer {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    /// Phrase `result` as an answer to `question`. Never fails: any model
    /// or grounding failure falls back to [`render`].
    pub fn compose(&self, question: &str, result: &ExecutionResult) -> ComposedAnswer {
        match self.model_answer(question, result) {
            Ok(text) => ComposedAnswer {
                text,
                source: AnswerSource::Model,
            },
            Err(ComposeError::Ungrounded(QueryError::UngroundedAnswer { tokens })) => {
                tracing::warn!(model = self.model.name(), ?tokens, "ungrounded answer replaced by template");
                self.template(result)
            }
            Err(e) => {
                tracing::debug!(model = self.model.name(), error = %e, "using template answer");
                self.template(result)
            }
        }
    }

    /// Model phrasing only, checked against the result.
    pub fn model_answer(&self, question: &str, result: &ExecutionResult) -> ComposeResult<String> {
        let result_json = serde_json::to_string_pretty(result)
            .map_err(|e| ComposeError::Serialization(e.to_string()))?;
        let request = ModelRequest {
            task: ModelTask::ComposeAnswer,
            system: COMPOSE_SYSTEM_PROMPT.to_string(),
            prompt: make_compose_prompt(question, &result_json),
            json_output: false,
            temperature: 0.0,
        };

        let (response, _) = self.retry.run("compose_answer", |_| self.model.complete(&request));
        let text = response?.trim().to_string();
        if text.is_empty() {
            return Err(ComposeError::Empty);
        }

        check_grounding(&text, result).map_err(ComposeError::Ungrounded)?;
        Ok(text)
    }

    fn template(&self, result: &ExecutionResult) -> ComposedAnswer {
        ComposedAnswer {
            text: render(result),
            source: AnswerSource::Template,
        }
    }
}
