//! Per-session query defaults.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Defaults a front-end supplies with each question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionContext {
    pub session_id: Uuid,
    /// Insurer assumed when a coverage question names none
    pub default_insurer: Option<String>,
    /// Reference date for coverage questions; today when unset
    pub as_of: Option<NaiveDate>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            default_insurer: None,
            as_of: None,
        }
    }

    pub fn with_insurer(mut self, insurer: &str) -> Self {
        self.default_insurer = Some(insurer.to_string());
        self
    }

    pub fn with_as_of(mut self, date: NaiveDate) -> Self {
        self.as_of = Some(date);
        self
    }
}
