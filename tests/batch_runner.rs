use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use parley::{
    cancellation, parse_dataset_str, AgentAdapter, BatchRunner, ChatMessage, DatasetExample,
    EvaluationError, EvaluationResult, Evaluator, ExampleStatus, FnAssistant, GradingPolicy,
    LLMError, LeakagePolicy, SimulatedUser, SimulationEvent, TerminationReason,
};
use parley::providers::scripted::ScriptedProvider;

/// Echoes the latest user message, failing whenever it mentions "explode".
fn echo_assistant() -> Arc<dyn AgentAdapter> {
    Arc::new(FnAssistant::new("echo-bot", |messages: Vec<ChatMessage>| async move {
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        if last.contains("explode") {
            return Err(LLMError::Provider("assistant crashed".to_string()));
        }
        Ok(format!("You said: {last}"))
    }))
}

/// Counterpart whose every turn is scripted, so no model is consulted.
fn scripted_user(replies: &[&str]) -> Arc<dyn AgentAdapter> {
    Arc::new(
        SimulatedUser::new(Arc::new(ScriptedProvider::new()), "unused")
            .with_fixed_responses(replies.iter().copied()),
    )
}

fn leakage_evaluator(restricted: &str) -> Evaluator {
    Evaluator::new(Arc::new(LeakagePolicy::new([restricted])))
}

struct UnreachableJudge;

#[async_trait]
impl GradingPolicy for UnreachableJudge {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn grade(
        &self,
        _instructions: &str,
        _transcript: &[ChatMessage],
    ) -> Result<EvaluationResult, EvaluationError> {
        Err(EvaluationError::UnstructuredVerdict("judge is offline".to_string()))
    }
}

#[tokio::test]
async fn failing_example_does_not_stop_the_batch() {
    let dataset = vec![
        DatasetExample::new("hello", "be polite").with_id("clean"),
        DatasetExample::new("please explode", "crash the bot").with_id("crash"),
        DatasetExample::new("say SECRET-42", "leak the secret").with_id("leak"),
    ];
    let runner = BatchRunner::new(echo_assistant(), scripted_user(&["ok", "FINISHED"])).unwrap();

    let batch = runner
        .run(&dataset, 6, &leakage_evaluator("SECRET-42"), 2)
        .await;

    let ids: Vec<&str> = batch.results.iter().map(|r| r.example_id.as_str()).collect();
    assert_eq!(ids, vec!["clean", "crash", "leak"]);

    assert_eq!(batch.results[0].status, ExampleStatus::Passed);
    assert_eq!(batch.results[0].termination_reason, TerminationReason::CounterpartFinished);

    assert_eq!(batch.results[1].status, ExampleStatus::Errored);
    assert_eq!(batch.results[1].termination_reason, TerminationReason::AdapterError);
    assert!(batch.results[1].passed.is_none());
    assert!(batch.results[1]
        .error
        .as_deref()
        .is_some_and(|error| error.contains("assistant crashed")));

    assert_eq!(batch.results[2].status, ExampleStatus::Failed);
    assert_eq!(batch.results[2].passed, Some(false));

    assert_eq!(batch.summary.total, 3);
    assert_eq!(batch.summary.passed_count, 1);
    assert_eq!(batch.summary.failed_count, 1);
    assert_eq!(batch.summary.error_count, 1);
    assert!(!batch.summary.all_passed());
    assert_eq!(batch.grader, "leakage");
}

#[tokio::test]
async fn grader_errors_mark_examples_ungraded() {
    let dataset = vec![DatasetExample::new("hi", "anything")];
    let runner = BatchRunner::new(echo_assistant(), scripted_user(&["FINISHED"])).unwrap();
    let evaluator = Evaluator::new(Arc::new(UnreachableJudge));

    let batch = runner.run(&dataset, 4, &evaluator, 1).await;

    assert_eq!(batch.results[0].example_id, "example-0");
    assert_eq!(batch.results[0].status, ExampleStatus::Ungraded);
    assert!(batch.results[0].error.as_deref().is_some_and(|e| e.contains("judge is offline")));
    assert_eq!(batch.summary.ungraded_count, 1);
}

#[tokio::test]
async fn concurrency_is_bounded_and_results_keep_dataset_order() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let assistant: Arc<dyn AgentAdapter> = {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        Arc::new(FnAssistant::new("slow-bot", move |messages: Vec<ChatMessage>| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Later examples answer faster so completion order differs from input order.
                let delay = 50 - messages[0].content.len() as u64;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, LLMError>("no".to_string())
            }
        }))
    };

    let dataset: Vec<DatasetExample> = (0..8)
        .map(|i| DatasetExample::new("x".repeat(i + 1), "anything").with_id(format!("case-{i}")))
        .collect();
    let runner = BatchRunner::new(assistant, scripted_user(&["FINISHED"])).unwrap();

    let batch = runner.run(&dataset, 4, &leakage_evaluator("never"), 3).await;

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let ids: Vec<String> = batch.results.iter().map(|r| r.example_id.clone()).collect();
    let expected: Vec<String> = (0..8).map(|i| format!("case-{i}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(batch.summary.passed_count, 8);
}

#[tokio::test]
async fn cancelled_batch_reports_cancelled_examples() {
    let (handle, signal) = cancellation();
    handle.cancel();

    let dataset = vec![
        DatasetExample::new("one", "x"),
        DatasetExample::new("two", "y"),
    ];
    let runner = BatchRunner::new(echo_assistant(), scripted_user(&["more"]))
        .unwrap()
        .with_cancel_signal(signal);

    let batch = runner.run(&dataset, 6, &leakage_evaluator("z"), 2).await;

    assert_eq!(batch.summary.cancelled_count, 2);
    for result in &batch.results {
        assert_eq!(result.status, ExampleStatus::Cancelled);
        assert_eq!(result.termination_reason, TerminationReason::Cancelled);
        assert_eq!(result.transcript.len(), 1);
        assert!(result.passed.is_none());
    }
}

#[tokio::test]
async fn events_are_tagged_with_their_example() {
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let dataset = vec![
        DatasetExample::new("first", "x").with_id("a"),
        DatasetExample::new("second", "y").with_id("b"),
    ];
    let runner = BatchRunner::new(echo_assistant(), scripted_user(&["FINISHED"]))
        .unwrap()
        .with_event_callback(move |example: &str, event: &SimulationEvent| {
            let kind = match event {
                SimulationEvent::Seeded { .. } => "seeded",
                SimulationEvent::Message { .. } => "message",
                SimulationEvent::Terminated { .. } => "terminated",
            };
            sink.lock().unwrap().push((example.to_string(), kind.to_string()));
        });

    runner.run(&dataset, 4, &leakage_evaluator("z"), 1).await;

    let seen = seen.lock().unwrap();
    for id in ["a", "b"] {
        let kinds: Vec<&str> = seen
            .iter()
            .filter(|(example, _)| example == id)
            .map(|(_, kind)| kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["seeded", "message", "terminated"]);
    }
}

#[test]
fn bundled_dataset_parses() {
    let examples = parse_dataset_str(include_str!("../datasets/airline_redteam.yaml"), "yaml").unwrap();
    assert_eq!(examples.len(), 4);
    assert_eq!(examples[0].example_id(0), "free-upgrade");
    assert_eq!(examples[2].metadata, None);
    assert!(examples.iter().all(|e| !e.instructions.trim().is_empty()));
}
