//! Follow-up question suggestions.

use crate::dataset::DatasetModel;
use crate::models::{IntentTag, ResolvedIntent};

/// Suggestions returned per answer.
pub const MAX_SUGGESTIONS: usize = 3;

/// Follow-up questions the engine can answer, given the intent just asked.
///
/// Only questions that name drugs and insurers present in `dataset` are
/// suggested, so each one resolves without clarification.
pub fn related_questions(intent: &ResolvedIntent, dataset: &DatasetModel) -> Vec<String> {
    let names: Vec<String> = intent.drugs().iter().map(|d| dataset.drug_display(d)).collect();
    let Some(drug) = names.first() else {
        return Vec::new();
    };
    let insurer = intent
        .insurer()
        .map(|i| dataset.insurer_display(i))
        .or_else(|| dataset.insurer_names().into_iter().next());
    let other_drug = dataset
        .drugs()
        .map(|entry| entry.display_name.clone())
        .find(|name| !names.contains(name));

    let has_generic = intent.drugs().first().is_some_and(|d| dataset.generic_of(d).is_some());

    let mut suggestions = Vec::new();
    match intent.tag {
        IntentTag::CostLookup => {
            if has_generic {
                suggestions.push(format!("How much would I save with the generic for {}?", drug));
            }
            suggestions.push(format!("How has the price of {} changed over time?", drug));
            if let Some(insurer) = &insurer {
                suggestions.push(format!("Is {} covered by {}?", drug, insurer));
            }
            if let Some(other) = &other_drug {
                suggestions.push(format!("How does {} compare to {} in price?", drug, other));
            }
        }
        IntentTag::CostTrend => {
            suggestions.push(format!("What is the lowest price of {}?", drug));
            suggestions.push(format!("What is the latest price of {}?", drug));
            if let Some(insurer) = &insurer {
                suggestions.push(format!("What tier is {} on with {}?", drug, insurer));
            }
        }
        IntentTag::CostComparison => {
            for name in &names {
                suggestions.push(format!("How has the price of {} changed over time?", name));
            }
            suggestions.push(format!("Which insurers cover {}?", drug));
        }
        IntentTag::CoverageLookup => {
            if has_generic {
                suggestions.push(format!("How much would I save with the generic for {}?", drug));
            }
            suggestions.push(format!("What tier is {} on?", drug));
            suggestions.push(format!("What is the latest price of {}?", drug));
            suggestions.push(format!("How has the price of {} changed over time?", drug));
        }
        IntentTag::TierLookup => {
            match &insurer {
                Some(insurer) => suggestions.push(format!("Is {} covered by {}?", drug, insurer)),
                None => suggestions.push(format!("Which insurers cover {}?", drug)),
            }
            suggestions.push(format!("What is the latest price of {}?", drug));
            if let Some(other) = &other_drug {
                suggestions.push(format!("What tier is {} on?", other));
            }
        }
    }

    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}
