//! Prompts for intent classification and grounded answer phrasing.
//!
//! The classification prompt pins the model to the fixed intent schema; the
//! compose prompt hands over only the computed figures.

/// Marker line carrying the user's question.
pub const QUESTION_MARKER: &str = "QUESTION:";
/// Marker line listing drug names and aliases present in the dataset.
pub const DRUGS_MARKER: &str = "KNOWN DRUGS:";
/// Marker line listing insurers present in the dataset.
pub const INSURERS_MARKER: &str = "KNOWN INSURERS:";
/// Marker line carrying today's date.
pub const TODAY_MARKER: &str = "TODAY:";

/// System prompt for intent classification.
pub const CLASSIFY_SYSTEM_PROMPT: &str = r#"You are a pharmacy data query classifier. You never answer questions yourself.

Map the user's question onto exactly one intent:
- COST_LOOKUP: unit cost of one drug (optionally over a date range, with an aggregation)
- COST_TREND: how one drug's unit cost changed over time
- COST_COMPARISON: cost difference between exactly two drugs, or between one drug and its generic equivalent (savings)
- COVERAGE_LOOKUP: insurance coverage, copay or coverage status of one drug
- TIER_LOOKUP: formulary tier of one drug

Extract parameters:
- drugs: drug names exactly as written in the question, in the order mentioned
- insurer: insurer name if mentioned
- as_of, from, to: dates as YYYY-MM-DD if mentioned
- aggregation: MEAN, MIN, MAX or LATEST if the question asks for one

If the question fits none of the intents, answer {"intent":"NONE"}.
Output a single JSON object and nothing else."#;

/// Parameter slots accepted in classifier output.
pub const INTENT_SLOTS: &[&str] = &["intent", "drugs", "insurer", "as_of", "from", "to", "aggregation"];

/// Few-shot examples for better classification accuracy.
pub const FEW_SHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "How much does Lipitor cost?",
        r#"{"intent":"COST_LOOKUP","drugs":["Lipitor"]}"#,
    ),
    (
        "Has the price of metformin gone up since 2024-01-01?",
        r#"{"intent":"COST_TREND","drugs":["metformin"],"from":"2024-01-01"}"#,
    ),
    (
        "Is Lipitor more expensive than atorvastatin?",
        r#"{"intent":"COST_COMPARISON","drugs":["Lipitor","atorvastatin"]}"#,
    ),
    (
        "How much would I save with the generic for Lipitor?",
        r#"{"intent":"COST_COMPARISON","drugs":["Lipitor"]}"#,
    ),
    (
        "Does Medicare cover Humira?",
        r#"{"intent":"COVERAGE_LOOKUP","drugs":["Humira"],"insurer":"Medicare"}"#,
    ),
    (
        "What tier is Xanax on Commercial plans?",
        r#"{"intent":"TIER_LOOKUP","drugs":["Xanax"],"insurer":"Commercial"}"#,
    ),
];

/// Dataset facts the classifier may refer to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationContext {
    pub drug_names: Vec<String>,
    pub insurers: Vec<String>,
    pub today: String,
}

/// User prompt for classifying one question.
pub fn make_classification_prompt(question: &str, context: &ClassificationContext) -> String {
    format!(
        "{drugs} {drug_list}\n{insurers} {insurer_list}\n{today} {date}\n{question_marker} {question}\n\nReturn one JSON object using only these keys: {slots}.",
        drugs = DRUGS_MARKER,
        drug_list = context.drug_names.join(", "),
        insurers = INSURERS_MARKER,
        insurer_list = context.insurers.join(", "),
        today = TODAY_MARKER,
        date = context.today,
        question_marker = QUESTION_MARKER,
        question = single_line(question),
        slots = INTENT_SLOTS.join(", "),
    )
}

/// Build the full classification prompt, optionally with few-shot examples.
pub fn build_classification_prompt(
    question: &str,
    context: &ClassificationContext,
    include_examples: bool,
) -> String {
    let mut prompt = String::new();

    if include_examples {
        prompt.push_str("Examples:\n");
        for (input, output) in FEW_SHOT_EXAMPLES {
            prompt.push_str("Q: ");
            prompt.push_str(input);
            prompt.push_str("\nA: ");
            prompt.push_str(output);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    prompt.push_str(&make_classification_prompt(question, context));
    prompt
}

/// System prompt for phrasing a computed result.
pub const COMPOSE_SYSTEM_PROMPT: &str = r#"You are a pharmacy data analyst writing a short answer for a patient or pharmacist.

Rules:
- Use ONLY the figures in the RESULT block. Never introduce, estimate or round a number to a different value.
- Do not perform new arithmetic. If a figure is not in RESULT, do not state it.
- Write dates exactly as they appear in RESULT.
- A negative difference means the first drug is cheaper. Keep its minus sign or say "cheaper"; never describe it as higher.
- Answer in at most four sentences of plain prose."#;

/// User prompt for phrasing a computed result.
pub fn make_compose_prompt(question: &str, result_json: &str) -> String {
    format!(
        "{marker} {question}\n\nRESULT:\n{result}\n\nWrite the answer.",
        marker = QUESTION_MARKER,
        question = single_line(question),
        result = result_json,
    )
}

/// Pull the question back out of a prompt built by this module.
pub fn extract_question(prompt: &str) -> Option<&str> {
    marker_value(prompt, QUESTION_MARKER)
}

/// Pull a comma-separated marker list back out of a prompt.
pub fn extract_list(prompt: &str, marker: &str) -> Vec<String> {
    marker_value(prompt, marker)
        .map(|value| {
            value
                .split(", ")
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn marker_value<'a>(prompt: &'a str, marker: &str) -> Option<&'a str> {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(marker))
        .map(str::trim)
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
