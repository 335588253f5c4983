//! Intent extraction from classifier output.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::{LanguageModel, ModelError, ModelRequest, ModelResult, ModelTask};
use crate::prompts::{self, DRUGS_MARKER, INSURERS_MARKER};

/// Extraction errors.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("Unknown intent tag: {0}")]
    UnknownIntent(String),

    #[error("Unknown aggregation: {0}")]
    UnknownAggregation(String),

    #[error("Classifier found no supported intent")]
    NoIntent,
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// The fixed set of supported query intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentTag {
    CostLookup,
    CostTrend,
    CoverageLookup,
    CostComparison,
    TierLookup,
}

impl IntentTag {
    pub const ALL: [IntentTag; 5] = [
        IntentTag::CostLookup,
        IntentTag::CostTrend,
        IntentTag::CoverageLookup,
        IntentTag::CostComparison,
        IntentTag::TierLookup,
    ];

    /// Wire name used in classifier output.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentTag::CostLookup => "COST_LOOKUP",
            IntentTag::CostTrend => "COST_TREND",
            IntentTag::CoverageLookup => "COVERAGE_LOOKUP",
            IntentTag::CostComparison => "COST_COMPARISON",
            IntentTag::TierLookup => "TIER_LOOKUP",
        }
    }

    /// Exact-match parse of a wire name. No case folding.
    pub fn parse(tag: &str) -> Option<IntentTag> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for IntentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation over unit costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    Mean,
    Min,
    Max,
    Latest,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "MEAN",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Latest => "LATEST",
        }
    }

    pub fn parse(name: &str) -> Option<Aggregation> {
        [
            Aggregation::Mean,
            Aggregation::Min,
            Aggregation::Max,
            Aggregation::Latest,
        ]
        .into_iter()
        .find(|a| a.as_str() == name)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw classifier output. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RawIntentOutput {
    pub intent: String,
    #[serde(default)]
    pub drugs: Vec<String>,
    #[serde(default)]
    pub insurer: Option<String>,
    #[serde(default)]
    pub as_of: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub aggregation: Option<String>,
}

/// Classifier output with the tag and aggregation validated.
///
/// Dates stay textual here; the core validates them against its calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedIntent {
    pub tag: IntentTag,
    pub drugs: Vec<String>,
    pub insurer: Option<String>,
    pub as_of: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub aggregation: Option<Aggregation>,
}

/// Parse classifier output JSON into a validated intent.
pub fn parse_intent_output(response: &str) -> ExtractionResult<ClassifiedIntent> {
    // Models sometimes wrap the object in prose or code fences.
    let json_start = response.find('{').ok_or_else(|| {
        ExtractionError::InvalidFormat("No JSON object found in response".into())
    })?;
    let json_end = response.rfind('}').ok_or_else(|| {
        ExtractionError::InvalidFormat("No closing brace found in response".into())
    })?;
    if json_end < json_start {
        return Err(ExtractionError::InvalidFormat("Unbalanced braces in response".into()));
    }

    let raw: RawIntentOutput = serde_json::from_str(&response[json_start..=json_end])?;
    validate(raw)
}

fn validate(raw: RawIntentOutput) -> ExtractionResult<ClassifiedIntent> {
    if raw.intent == "NONE" {
        return Err(ExtractionError::NoIntent);
    }
    let tag = IntentTag::parse(&raw.intent)
        .ok_or_else(|| ExtractionError::UnknownIntent(raw.intent.clone()))?;

    let aggregation = match raw.aggregation.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(name) => Some(
            Aggregation::parse(name)
                .ok_or_else(|| ExtractionError::UnknownAggregation(name.to_string()))?,
        ),
    };

    Ok(ClassifiedIntent {
        tag,
        drugs: raw
            .drugs
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect(),
        insurer: non_empty(raw.insurer),
        as_of: non_empty(raw.as_of),
        from: non_empty(raw.from),
        to: non_empty(raw.to),
        aggregation,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// =========================================================================
// Keyword classifier
// =========================================================================

/// Offline classifier using keyword routing.
///
/// Reads the question and dataset vocabulary back out of the classification
/// prompt and emits schema-conforming JSON, so it exercises the same parsing
/// and validation path as a real model. Compose requests are unsupported,
/// which sends answers down the templated path.
#[derive(Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a question against the given vocabulary.
    pub fn classify(question: &str, drug_names: &[String], insurers: &[String]) -> RawIntentOutput {
        let lower = question.to_lowercase();
        let drugs = find_drug_mentions(question, &lower, drug_names, insurers);

        let intent = if contains_any(&lower, &["trend", "over time", "changed", "history", "gone up", "gone down"]) {
            IntentTag::CostTrend.as_str()
        } else if drugs.len() >= 2
            && contains_any(&lower, &["compare", " vs", "versus", "difference", "cheaper", "more expensive", "than"])
        {
            IntentTag::CostComparison.as_str()
        } else if !drugs.is_empty() && contains_any(&lower, &["generic", "savings", "save"]) {
            IntentTag::CostComparison.as_str()
        } else if contains_any(&lower, &["tier", "formulary"]) {
            IntentTag::TierLookup.as_str()
        } else if contains_any(
            &lower,
            &[
                "coverage", "cover", "insurance", "copay", "co-pay", "authorization", "prior auth",
                "requirement", "restriction", "step therapy",
            ],
        ) {
            IntentTag::CoverageLookup.as_str()
        } else if contains_any(&lower, &["price", "cost", "how much", "expensive", "cheap"]) {
            IntentTag::CostLookup.as_str()
        } else {
            "NONE"
        };

        let insurer = insurers
            .iter()
            .find(|i| contains_word(&lower, &i.to_lowercase()))
            .cloned();

        let aggregation = if contains_any(&lower, &["average", "mean"]) {
            Some(Aggregation::Mean)
        } else if contains_any(&lower, &["lowest", "minimum", "cheapest"]) {
            Some(Aggregation::Min)
        } else if contains_any(&lower, &["highest", "maximum", "most expensive"]) {
            Some(Aggregation::Max)
        } else {
            None
        };

        let (as_of, from, to) = extract_dates(&lower);

        RawIntentOutput {
            intent: intent.to_string(),
            drugs,
            insurer,
            as_of,
            from,
            to,
            aggregation: aggregation.map(|a| a.as_str().to_string()),
        }
    }
}

impl LanguageModel for KeywordClassifier {
    fn complete(&self, request: &ModelRequest) -> ModelResult<String> {
        if request.task != ModelTask::ClassifyIntent {
            return Err(ModelError::Unsupported(format!("{:?}", request.task)));
        }
        let question = prompts::extract_question(&request.prompt)
            .ok_or_else(|| ModelError::InvalidResponse("prompt carries no question".into()))?;
        let drug_names = prompts::extract_list(&request.prompt, DRUGS_MARKER);
        let insurers = prompts::extract_list(&request.prompt, INSURERS_MARKER);

        let output = Self::classify(question, &drug_names, &insurers);
        serde_json::to_string(&output).map_err(|e| ModelError::InvalidResponse(e.to_string()))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

/// Whole-word containment on lowercase text.
fn contains_word(text: &str, word: &str) -> bool {
    find_word(text, word, 0).is_some()
}

fn find_word(text: &str, word: &str, from: usize) -> Option<usize> {
    if word.is_empty() {
        return None;
    }
    let mut start = from;
    while let Some(pos) = text[start..].find(word) {
        let begin = start + pos;
        let end = begin + word.len();
        let before_ok = text[..begin]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = text[end..].chars().next().map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(begin);
        }
        start = begin + word.len();
    }
    None
}

/// Known names in order of first appearance; longer names win overlaps.
/// Falls back to capitalised words when no known name appears.
fn find_drug_mentions(
    question: &str,
    lower: &str,
    drug_names: &[String],
    insurers: &[String],
) -> Vec<String> {
    let mut hits: Vec<(usize, usize, &String)> = drug_names
        .iter()
        .filter_map(|name| {
            let needle = name.to_lowercase();
            find_word(lower, &needle, 0).map(|pos| (pos, pos + needle.len(), name))
        })
        .collect();
    hits.sort_by(|a, b| a.0.cmp(&b.0).then((b.1 - b.0).cmp(&(a.1 - a.0))));

    let mut mentions = Vec::new();
    let mut covered_until = 0;
    for (start, end, name) in hits {
        if start < covered_until {
            continue;
        }
        covered_until = end;
        mentions.push(name.clone());
    }
    if !mentions.is_empty() {
        return mentions;
    }

    let insurer_words: Vec<String> = insurers.iter().map(|i| i.to_lowercase()).collect();
    question
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .skip(1)
        .filter(|w| w.len() > 2 && w.chars().next().is_some_and(char::is_uppercase))
        .filter(|w| !insurer_words.contains(&w.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// ISO dates keyed by the word before them.
fn extract_dates(lower: &str) -> (Option<String>, Option<String>, Option<String>) {
    let words: Vec<&str> = lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !(c.is_alphanumeric() || c == '-')))
        .collect();

    let (mut as_of, mut from, mut to) = (None, None, None);
    for (i, word) in words.iter().enumerate() {
        if !is_iso_date(word) {
            continue;
        }
        let previous = if i > 0 { words[i - 1] } else { "" };
        match previous {
            "since" | "from" | "after" => from = Some(word.to_string()),
            "until" | "to" | "before" | "through" => to = Some(word.to_string()),
            _ => as_of = Some(word.to_string()),
        }
    }
    (as_of, from, to)
}

fn is_iso_date(word: &str) -> bool {
    let bytes = word.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
}
