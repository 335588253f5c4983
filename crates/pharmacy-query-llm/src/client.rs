//! Language-model clients.
//!
//! Every model call in the engine goes through [`LanguageModel`]. The trait is
//! blocking: callers run one question cycle at a time and the HTTP backend
//! bounds each call with a request timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Errors raised at the model boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Cannot connect to model server at {0}")]
    Connection(String),

    #[error("Model server returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    #[error("Model does not support task: {0}")]
    Unsupported(String),
}

impl ModelError {
    /// Whether a fresh attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Timeout(_) | ModelError::Connection(_) | ModelError::Transport(_) => true,
            ModelError::Http { status, .. } => *status == 429 || *status >= 500,
            ModelError::InvalidResponse(_) | ModelError::Unsupported(_) => false,
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;

/// What a request asks the model to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTask {
    /// Map a question onto the intent schema (JSON output).
    ClassifyIntent,
    /// Phrase an execution result as prose.
    ComposeAnswer,
}

/// A single model request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub task: ModelTask,
    pub system: String,
    pub prompt: String,
    /// Ask the backend to constrain output to JSON.
    pub json_output: bool,
    pub temperature: f32,
}

/// A blocking language-model backend.
pub trait LanguageModel: Send + Sync {
    /// Run one completion.
    fn complete(&self, request: &ModelRequest) -> ModelResult<String>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// =========================================================================
// Ollama
// =========================================================================

#[cfg(feature = "ollama")]
pub use ollama::OllamaClient;

#[cfg(feature = "ollama")]
mod ollama {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::{LanguageModel, ModelError, ModelRequest, ModelResult};

    /// Ollama HTTP client for local inference.
    pub struct OllamaClient {
        base_url: String,
        model: String,
        client: reqwest::blocking::Client,
        timeout_secs: u64,
    }

    #[derive(Serialize)]
    struct GenerateRequest<'a> {
        model: &'a str,
        prompt: &'a str,
        system: &'a str,
        stream: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        format: Option<&'a str>,
        options: GenerateOptions,
    }

    #[derive(Serialize)]
    struct GenerateOptions {
        temperature: f32,
    }

    #[derive(Deserialize)]
    struct GenerateResponse {
        response: String,
    }

    impl OllamaClient {
        /// Create a client for `model` served at `base_url`.
        pub fn new(base_url: &str, model: &str, timeout: Duration) -> ModelResult<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ModelError::Transport(e.to_string()))?;

            Ok(Self {
                base_url: base_url.trim_end_matches('/').to_string(),
                model: model.to_string(),
                client,
                timeout_secs: timeout.as_secs(),
            })
        }

        /// Local Ollama at the default port with a 30 second timeout.
        pub fn default_local(model: &str) -> ModelResult<Self> {
            Self::new("http://localhost:11434", model, Duration::from_secs(30))
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }
    }

    impl LanguageModel for OllamaClient {
        fn complete(&self, request: &ModelRequest) -> ModelResult<String> {
            let url = format!("{}/api/generate", self.base_url);
            let body = GenerateRequest {
                model: &self.model,
                prompt: &request.prompt,
                system: &request.system,
                stream: false,
                format: request.json_output.then_some("json"),
                options: GenerateOptions {
                    temperature: request.temperature,
                },
            };

            let response = self.client.post(&url).json(&body).send().map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    ModelError::Connection(self.base_url.clone())
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(ModelError::Http {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed: GenerateResponse = response
                .json()
                .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

            Ok(parsed.response)
        }

        fn name(&self) -> &str {
            &self.model
        }
    }
}

// =========================================================================
// Scripted model (tests and demos)
// =========================================================================

/// Model that replays canned responses per task.
///
/// The last queued response for a task repeats once the queue drains, so a
/// single `on` call answers every request of that task.
pub struct ScriptedModel {
    responses: Mutex<HashMap<ModelTask, VecDeque<ModelResult<String>>>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Queue a successful response for `task`.
    pub fn on(self, task: ModelTask, response: &str) -> Self {
        self.push(task, Ok(response.to_string()))
    }

    /// Queue a failure for `task`.
    pub fn failing(self, task: ModelTask, error: ModelError) -> Self {
        self.push(task, Err(error))
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Total number of `complete` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, task: ModelTask, response: ModelResult<String>) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task)
            .or_default()
            .push_back(response);
        self
    }
}

impl LanguageModel for ScriptedModel {
    fn complete(&self, request: &ModelRequest) -> ModelResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = responses
            .get_mut(&request.task)
            .ok_or_else(|| ModelError::Unsupported(format!("{:?}", request.task)))?;

        match queue.len() {
            0 => Err(ModelError::Unsupported(format!("{:?}", request.task))),
            1 => queue[0].clone(),
            _ => queue
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Unsupported(format!("{:?}", request.task)))),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task: ModelTask) -> ModelRequest {
        ModelRequest {
            task,
            system: String::new(),
            prompt: "test".into(),
            json_output: false,
            temperature: 0.0,
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ModelError::Timeout(30).is_retryable());
        assert!(ModelError::Connection("http://x".into()).is_retryable());
        assert!(ModelError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(ModelError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!ModelError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!ModelError::InvalidResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_scripted_sequence_then_repeat() {
        let model = ScriptedModel::new()
            .failing(ModelTask::ClassifyIntent, ModelError::Timeout(1))
            .on(ModelTask::ClassifyIntent, "ok");

        let req = request(ModelTask::ClassifyIntent);
        assert_eq!(model.complete(&req), Err(ModelError::Timeout(1)));
        assert_eq!(model.complete(&req), Ok("ok".to_string()));
        assert_eq!(model.complete(&req), Ok("ok".to_string()));
        assert_eq!(model.calls(), 3);
    }

    #[test]
    fn test_scripted_unknown_task() {
        let model = ScriptedModel::new().on(ModelTask::ClassifyIntent, "{}");
        let result = model.complete(&request(ModelTask::ComposeAnswer));
        assert!(matches!(result, Err(ModelError::Unsupported(_))));
    }
}
