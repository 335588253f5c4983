//! Mechanical answer rendering.
//!
//! Used whenever model phrasing is unavailable or fails the grounding check.
//! Every figure it writes comes straight from the result.

use crate::models::{Cell, ExecutionResult, ResultValue, SeriesPoint, Unit};

/// Columns rendered as dollar amounts.
const MONEY_COLUMNS: [&str; 2] = ["patient_cost", "unit_cost"];

/// Direction of a time series, first point to last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Flat,
}

impl TrendDirection {
    pub fn of(points: &[SeriesPoint]) -> TrendDirection {
        match (points.first(), points.last()) {
            (Some(first), Some(last)) if last.value > first.value => TrendDirection::Increasing,
            (Some(first), Some(last)) if last.value < first.value => TrendDirection::Decreasing,
            _ => TrendDirection::Flat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Flat => "flat",
        }
    }
}

/// Render `result` as plain sentences.
pub fn render(result: &ExecutionResult) -> String {
    let mut sentences = match &result.value {
        ResultValue::Scalar { value, unit, label } => {
            vec![format!("The {} is {}.", label, format_value(*value, *unit))]
        }
        ResultValue::TimeSeries { unit, label, points } => render_series(label, *unit, points),
        ResultValue::Table { columns, rows } => render_table(columns, rows),
    };

    if let Some(note) = result.provenance.exclusion_note() {
        sentences.push(format!("{}.", capitalize(&note)));
    }
    let ids: Vec<&str> = result
        .provenance
        .sources
        .iter()
        .map(|s| s.record_id.0.as_str())
        .collect();
    if !ids.is_empty() {
        sentences.push(format!("Sources: {}.", ids.join(", ")));
    }

    sentences.join(" ")
}

fn render_series(label: &str, unit: Unit, points: &[SeriesPoint]) -> Vec<String> {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return vec![format!("No data points for the {}.", label)];
    };
    if points.len() == 1 {
        return vec![format!(
            "The {} was {} in {}; the trend is flat with a single month of data.",
            label,
            format_value(first.value, unit),
            first.period
        )];
    }

    let listed: Vec<String> = points
        .iter()
        .map(|p| format!("{} in {}", format_value(p.value, unit), p.period))
        .collect();
    vec![
        format!("The {}: {}.", label, listed.join(", ")),
        format!(
            "From {} to {} the trend is {}.",
            first.period,
            last.period,
            TrendDirection::of(points).as_str()
        ),
    ]
}

fn render_table(columns: &[String], rows: &[Vec<Cell>]) -> Vec<String> {
    rows.iter()
        .map(|row| {
            let fields: Vec<String> = columns
                .iter()
                .zip(row)
                .filter_map(|(column, cell)| {
                    let rendered = match cell {
                        Cell::Number(n) if MONEY_COLUMNS.contains(&column.as_str()) => {
                            format_value(*n, Unit::Usd)
                        }
                        Cell::Number(n) => format_value(*n, Unit::Tier),
                        Cell::Text(text) => text.clone(),
                        Cell::Empty => return None,
                    };
                    Some(format!("{}: {}", column.replace('_', " "), rendered))
                })
                .collect();
            format!("{}.", fields.join("; "))
        })
        .collect()
}

/// `$55.00`, `-$15.00`, or a bare number for tiers.
pub fn format_value(value: f64, unit: Unit) -> String {
    match unit {
        Unit::Usd if value < 0.0 => format!("-${:.2}", value.abs()),
        Unit::Usd => format!("${:.2}", value),
        Unit::Tier if value.fract() == 0.0 => format!("{}", value as i64),
        Unit::Tier => format!("{}", value),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::check_grounding;
    use crate::models::{DrugId, Provenance, RecordId, SourceRef};
    use chrono::NaiveDate;

    fn point(period: &str, value: f64) -> SeriesPoint {
        SeriesPoint {
            period: period.into(),
            value,
        }
    }

    fn series(points: Vec<SeriesPoint>) -> ExecutionResult {
        ExecutionResult {
            value: ResultValue::TimeSeries {
                unit: Unit::Usd,
                label: "monthly mean unit cost of DrugA".into(),
                points,
            },
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_trend_states_values_and_direction() {
        let text = render(&series(vec![point("2024-01", 50.0), point("2024-02", 55.0)]));
        assert!(text.contains("$50.00 in 2024-01"), "{}", text);
        assert!(text.contains("$55.00 in 2024-02"), "{}", text);
        assert!(text.contains("increasing"), "{}", text);
    }

    #[test]
    fn test_trend_direction() {
        assert_eq!(
            TrendDirection::of(&[point("a", 3.0), point("b", 1.0)]),
            TrendDirection::Decreasing
        );
        assert_eq!(
            TrendDirection::of(&[point("a", 3.0), point("b", 9.0), point("c", 3.0)]),
            TrendDirection::Flat
        );
        assert_eq!(TrendDirection::of(&[]), TrendDirection::Flat);
    }

    #[test]
    fn test_scalar_and_exclusions() {
        let result = ExecutionResult {
            value: ResultValue::Scalar {
                value: -15.0,
                unit: Unit::Usd,
                label: "latest unit cost of DrugB minus DrugA".into(),
            },
            provenance: Provenance {
                sources: vec![SourceRef {
                    record_id: RecordId("med-0003".into()),
                    drug: DrugId::new("drugb"),
                    date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                    value: Some(40.0),
                }],
                filters: vec![],
                excluded_missing: 1,
            },
        };
        assert_eq!(
            render(&result),
            "The latest unit cost of DrugB minus DrugA is -$15.00. \
             1 record excluded for missing data. Sources: med-0003."
        );
        assert_eq!(check_grounding(&render(&result), &result), Ok(()));
    }

    #[test]
    fn test_table_skips_empty_cells() {
        let result = ExecutionResult {
            value: ResultValue::Table {
                columns: vec!["insurer".into(), "tier".into(), "patient_cost".into(), "effective_until".into()],
                rows: vec![vec![
                    Cell::Text("InsurerX".into()),
                    Cell::Number(2.0),
                    Cell::Number(11.0),
                    Cell::Empty,
                ]],
            },
            provenance: Provenance::default(),
        };
        assert_eq!(render(&result), "insurer: InsurerX; tier: 2; patient cost: $11.00.");
    }

    #[test]
    fn test_rendering_is_grounded() {
        let result = series(vec![point("2024-01", 50.0), point("2024-02", 55.0), point("2024-03", 52.5)]);
        assert_eq!(check_grounding(&render(&result), &result), Ok(()));

        let falling = series(vec![point("2024-01", 55.0), point("2024-02", 50.0)]);
        assert_eq!(check_grounding(&render(&falling), &falling), Ok(()));
    }
}
