//! Language-model boundary for the pharmacy query engine.
//!
//! This crate owns everything that touches a model: the [`LanguageModel`]
//! trait and its Ollama backend, the classification and compose prompts,
//! strict parsing of classifier output, and bounded retry.

pub mod client;
pub mod extraction;
pub mod prompts;
pub mod retry;

pub use client::*;
pub use extraction::*;
pub use prompts::*;
pub use retry::*;
