//! Grounding check for model-written answers.
//!
//! Record ids and ISO dates must name ones the result carries, the
//! exclusion note may state its own count, and every other number must match
//! a figure of the result within the precision it was written with: "$55"
//! matches 54.99, "$55.00" does not. Numbers are compared signed. Direction
//! words must agree with the sign of a difference or the slope of a trend.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{QueryError, QueryResult};
use crate::models::ExecutionResult;

/// `med-0001`, `cov-0002`
static RECORD_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(?:med|cov)-\d+\b").unwrap());

/// `YYYY-MM-DD` or `YYYY-MM`
static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}(?:-\d{2})?\b").unwrap());

/// Unsigned decimals with optional thousands separators
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").unwrap());

static RISING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:increas\w*|rose|rises?|rising|risen|higher|more|pricier|costlier)\b").unwrap()
});

static FALLING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:decreas\w*|fell|falls?|falling|fallen|drop\w*|lower|cheaper|less)\b").unwrap()
});

const FLOAT_SLACK: f64 = 1e-9;

/// Fail with `UngroundedAnswer` listing every token the result cannot back.
pub fn check_grounding(answer: &str, result: &ExecutionResult) -> QueryResult<()> {
    let tokens = ungrounded_tokens(answer, result);
    if tokens.is_empty() {
        Ok(())
    } else {
        Err(QueryError::UngroundedAnswer { tokens })
    }
}

/// Tokens in `answer` the result cannot back, in check order.
pub fn ungrounded_tokens(answer: &str, result: &ExecutionResult) -> Vec<String> {
    let mut ungrounded = Vec::new();
    let mut remainder = answer.to_string();

    // Whole tokens first, blanked so their digits are not re-read as numbers
    let ids = result.provenance.record_ids();
    for found in RECORD_ID.find_iter(answer) {
        if !ids.iter().any(|id| id.0 == found.as_str()) {
            ungrounded.push(found.as_str().to_string());
        }
        blank(&mut remainder, found.range());
    }

    let labels = result.date_labels();
    let scanned = remainder.clone();
    for found in ISO_DATE.find_iter(&scanned) {
        let date = found.as_str();
        let known = labels
            .iter()
            .any(|label| label == date || (date.len() == 7 && label.starts_with(date)));
        if !known {
            ungrounded.push(date.to_string());
        }
        blank(&mut remainder, found.range());
    }

    if let Some(note) = result.provenance.exclusion_note() {
        if let Ok(pattern) = Regex::new(&format!("(?i){}", regex::escape(&note))) {
            let scanned = remainder.clone();
            for found in pattern.find_iter(&scanned) {
                blank(&mut remainder, found.range());
            }
        }
    }

    let direction = result.direction();
    let rising = RISING.find(&remainder).map(|m| m.as_str().to_string());
    let falling = FALLING.find(&remainder).map(|m| m.as_str().to_string());
    let contradicting = match direction {
        Some(Ordering::Greater) => vec![falling.clone()],
        Some(Ordering::Less) => vec![rising.clone()],
        Some(Ordering::Equal) => vec![rising.clone(), falling.clone()],
        None => vec![],
    };
    ungrounded.extend(contradicting.into_iter().flatten());

    let mut figures = result.grounding_numbers();
    // "$15 cheaper" states -15 once the words agree with the sign
    if direction == Some(Ordering::Less) && falling.is_some() && rising.is_none() {
        let magnitudes: Vec<f64> = figures.iter().filter(|n| **n < 0.0).map(|n| -n).collect();
        figures.extend(magnitudes);
    }

    for found in NUMBER.find_iter(&remainder) {
        let token = found.as_str();
        let Some((magnitude, tolerance)) = parse_token(token) else {
            continue;
        };
        let value = if is_negated(&remainder, found.start()) {
            -magnitude
        } else {
            magnitude
        };
        if !figures.iter().any(|n| (n - value).abs() <= tolerance) {
            let written = if value < 0.0 { format!("-{}", token) } else { token.to_string() };
            ungrounded.push(written);
        }
    }

    ungrounded
}

fn blank(text: &mut String, range: std::ops::Range<usize>) {
    let width = range.len();
    text.replace_range(range, &" ".repeat(width));
}

/// A minus sign directly before the number (or its `$`), not joining a range.
fn is_negated(text: &str, start: usize) -> bool {
    let before = &text[..start];
    let before = before.strip_suffix('$').unwrap_or(before);
    match before.strip_suffix('-') {
        Some(rest) => !rest
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '$' || c == ')' || c == '%'),
        None => false,
    }
}

/// Parse a numeric token and the tolerance implied by its written precision.
fn parse_token(token: &str) -> Option<(f64, f64)> {
    let plain = token.replace(',', "");
    let value: f64 = plain.parse().ok()?;
    let decimals = plain.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0);
    let tolerance = 0.5 * 10f64.powi(-(decimals as i32)) + FLOAT_SLACK;
    Some((value, tolerance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Cell, DrugId, Provenance, RecordId, ResultValue, SeriesPoint, SourceRef, Unit,
    };
    use chrono::NaiveDate;

    fn trend_result() -> ExecutionResult {
        let source = |id: &str, m: u32, v: f64| SourceRef {
            record_id: RecordId(id.into()),
            drug: DrugId::new("druga"),
            date: NaiveDate::from_ymd_opt(2024, m, 10).unwrap(),
            value: Some(v),
        };
        ExecutionResult {
            value: ResultValue::TimeSeries {
                unit: Unit::Usd,
                label: "monthly mean unit cost of DrugA".into(),
                points: vec![
                    SeriesPoint { period: "2024-01".into(), value: 50.0 },
                    SeriesPoint { period: "2024-02".into(), value: 55.0 },
                ],
            },
            provenance: Provenance {
                sources: vec![source("med-0001", 1, 50.0), source("med-0002", 2, 55.0)],
                filters: vec!["drug in [druga]".into()],
                excluded_missing: 0,
            },
        }
    }

    #[test]
    fn test_grounded_answer_passes() {
        let result = trend_result();
        let answer = "DrugA rose from $50.00 in 2024-01 to $55 in 2024-02 (med-0001, med-0002).";
        assert_eq!(check_grounding(answer, &result), Ok(()));
    }

    #[test]
    fn test_invented_number_fails() {
        let result = trend_result();
        let err = check_grounding("The price rose 10% to $55.00.", &result).unwrap_err();
        assert_eq!(
            err,
            QueryError::UngroundedAnswer {
                tokens: vec!["10".into()]
            }
        );
    }

    #[test]
    fn test_precision_matters() {
        let result = trend_result();
        // 54.99 is outside the precision of "$55.00" but 55.4 is within "$55"
        assert!(check_grounding("$55.4", &result).is_err());
        assert!(check_grounding("about $55", &result).is_ok());
        assert!(check_grounding("$54.99", &result).is_err());
    }

    #[test]
    fn test_unknown_date_fails() {
        let result = trend_result();
        let tokens = ungrounded_tokens("Prices in 2023-12 and 2024-01-10 differ.", &result);
        assert_eq!(tokens, vec!["2023-12"]);
    }

    #[test]
    fn test_thousands_separator() {
        let mut result = trend_result();
        result.value = ResultValue::Scalar {
            value: 1250.5,
            unit: Unit::Usd,
            label: "latest unit cost of DrugA".into(),
        };
        assert!(check_grounding("It costs $1,250.50.", &result).is_ok());
    }

    fn difference_result(value: f64) -> ExecutionResult {
        let source = |id: &str, m: u32, d: u32, v: f64| SourceRef {
            record_id: RecordId(id.into()),
            drug: DrugId::new("druga"),
            date: NaiveDate::from_ymd_opt(2024, m, d).unwrap(),
            value: Some(v),
        };
        ExecutionResult {
            value: ResultValue::Scalar {
                value,
                unit: Unit::Usd,
                label: "latest unit cost of DrugA minus DrugB".into(),
            },
            provenance: Provenance {
                sources: vec![source("med-0002", 2, 10, 55.0), source("med-0003", 1, 5, 40.0)],
                filters: vec!["drug in [druga, drugb]".into()],
                excluded_missing: 1,
            },
        }
    }

    #[test]
    fn test_date_parts_and_counts_do_not_back_figures() {
        let result = difference_result(15.0);
        let answer = "DrugA costs $15 more, a 10% premium; prices rose 2 times and will drop $5 next year.";
        assert_eq!(ungrounded_tokens(answer, &result), vec!["drop", "10", "2", "5"]);
    }

    #[test]
    fn test_sign_and_direction_must_agree() {
        let pricier = difference_result(15.0);
        assert!(check_grounding("DrugA costs $15.00 more than DrugB.", &pricier).is_ok());
        assert_eq!(ungrounded_tokens("DrugA is $15.00 cheaper.", &pricier), vec!["cheaper"]);
        assert_eq!(ungrounded_tokens("The difference is -$15.00.", &pricier), vec!["-15.00"]);

        let cheaper = difference_result(-15.0);
        assert!(check_grounding("The difference is -$15.00.", &cheaper).is_ok());
        assert!(check_grounding("DrugA is $15.00 cheaper than DrugB.", &cheaper).is_ok());
        assert_eq!(ungrounded_tokens("DrugA costs $15.00 more.", &cheaper), vec!["more", "15.00"]);
    }

    #[test]
    fn test_record_ids_must_be_cited_sources() {
        let result = difference_result(15.0);
        assert!(check_grounding("Sources: med-0002, med-0003.", &result).is_ok());
        assert_eq!(ungrounded_tokens("Sources: med-0002, med-0042.", &result), vec!["med-0042"]);
    }

    #[test]
    fn test_exclusion_note_may_state_its_count() {
        let result = difference_result(-15.0);
        let answer = "The latest unit cost of DrugA minus DrugB is -$15.00. \
                      1 record excluded for missing data. Sources: med-0002, med-0003.";
        assert!(check_grounding(answer, &result).is_ok());
        assert_eq!(ungrounded_tokens("3 records were skipped.", &result), vec!["3"]);
    }

    #[test]
    fn test_copay_range_is_not_a_negative_figure() {
        let mut result = trend_result();
        result.value = ResultValue::Table {
            columns: vec!["copay".into()],
            rows: vec![vec![Cell::Text("20% coinsurance ($5.00-$25.00)".into())]],
        };
        assert!(check_grounding("copay: 20% coinsurance ($5.00-$25.00).", &result).is_ok());
    }
}
