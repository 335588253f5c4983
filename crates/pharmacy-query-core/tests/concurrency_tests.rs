//! Shared-engine concurrency tests.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pharmacy_query_core::models::ResultValue;
use pharmacy_query_core::{CacheOutcome, Outcome, QueryEngine, SessionContext};
use pharmacy_query_llm::{KeywordClassifier, ModelTask, ScriptedModel};

const THREADS: usize = 8;

fn ask_concurrently(engine: &Arc<QueryEngine>, question: &'static str) -> Vec<pharmacy_query_core::Answer> {
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = Arc::clone(engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let session = SessionContext::new();
                barrier.wait();
                engine.ask(question, &session)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_identical_questions_execute_once() {
    let model = Arc::new(
        ScriptedModel::new()
            .on(ModelTask::ClassifyIntent, r#"{"intent":"COST_TREND","drugs":["DrugA"]}"#)
            .with_delay(Duration::from_millis(100)),
    );
    let engine = Arc::new(QueryEngine::new(common::scenario_dataset(), model.clone()).with_today(common::today()));

    let answers = ask_concurrently(&engine, "What's the trend for DrugA?");

    assert!(answers.iter().all(|a| a.outcome == Outcome::Answered));
    assert!(answers.windows(2).all(|w| w[0].result == w[1].result));
    assert_eq!(engine.stats().cache.computations, 1);
    assert_eq!(
        answers
            .iter()
            .filter(|a| a.cache == Some(CacheOutcome::Computed))
            .count(),
        1
    );

    // One classification shared by all, then one compose attempt per caller
    assert!(model.calls() < 2 * THREADS, "calls: {}", model.calls());
}

#[test]
fn test_distinct_questions_run_independently() {
    let engine = Arc::new(
        QueryEngine::new(common::scenario_dataset(), Arc::new(KeywordClassifier::new())).with_today(common::today()),
    );
    let questions = [
        "How much does DrugA cost?",
        "How much does DrugB cost?",
        "What's the trend for DrugA?",
        "Compare DrugA vs DrugB",
    ];

    let handles: Vec<_> = questions
        .iter()
        .map(|question| {
            let engine = Arc::clone(&engine);
            let question = question.to_string();
            thread::spawn(move || engine.ask(&question, &SessionContext::new()))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().outcome, Outcome::Answered);
    }

    assert_eq!(engine.stats().cache.computations, questions.len() as u64);
    assert_eq!(engine.cache().len(), questions.len());
}

#[test]
fn test_reload_during_questions_never_serves_stale_results() {
    let engine = Arc::new(
        QueryEngine::new(common::scenario_dataset(), Arc::new(KeywordClassifier::new())).with_today(common::today()),
    );
    let question = "How much does DrugA cost?";
    assert!(engine.ask(question, &SessionContext::new()).text.contains("$55.00"));

    let mut rows = common::scenario_rows();
    rows.push(common::row(&[
        ("drug_name", "DrugA"),
        ("price_date", "2024-02-20"),
        ("unit_cost", "60"),
    ]));

    let askers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                (0..20)
                    .map(|_| engine.ask(question, &SessionContext::new()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let version = engine.reload(&rows).unwrap();

    for asker in askers {
        for answer in asker.join().unwrap() {
            let value = match answer.result.map(|r| r.value) {
                Some(ResultValue::Scalar { value, .. }) => value,
                other => panic!("expected scalar, got {:?}", other),
            };
            // Every answer is consistent with the snapshot it was computed on
            let expected = if answer.dataset_version == version { 60.0 } else { 55.0 };
            assert_eq!(value, expected);
        }
    }

    let after = engine.ask(question, &SessionContext::new());
    assert_eq!(after.dataset_version, version);
    assert!(after.text.contains("$60.00"), "{}", after.text);
    assert_eq!(engine.cache().len(), 1);
}
