use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    agents::{AdapterError, AgentAdapter},
    dataset::DatasetExample,
    evaluator::Evaluator,
    simulation::{
        CancelSignal, EventCallback, SimulationEvent, SimulationOrchestrator, TerminationReason,
    },
    types::ChatMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleStatus {
    Passed,
    Failed,
    Ungraded,
    Errored,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleResult {
    pub example_id: String,
    pub status: ExampleStatus,
    pub termination_reason: TerminationReason,
    pub turn_count: usize,
    pub transcript: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub ungraded_count: usize,
    pub error_count: usize,
    pub cancelled_count: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[ExampleResult]) -> Self {
        let mut summary = BatchSummary {
            total: results.len(),
            ..BatchSummary::default()
        };
        for result in results {
            match result.status {
                ExampleStatus::Passed => summary.passed_count += 1,
                ExampleStatus::Failed => summary.failed_count += 1,
                ExampleStatus::Ungraded => summary.ungraded_count += 1,
                ExampleStatus::Errored => summary.error_count += 1,
                ExampleStatus::Cancelled => summary.cancelled_count += 1,
            }
        }
        summary
    }

    pub fn all_passed(&self) -> bool {
        self.passed_count == self.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub max_turns: usize,
    pub grader: String,
    pub results: Vec<ExampleResult>,
    pub summary: BatchSummary,
}

type BatchEventCallback = Arc<dyn Fn(&str, &SimulationEvent) + Send + Sync>;

/// Runs every dataset example through its own orchestrator and grades the transcripts.
#[derive(Clone)]
pub struct BatchRunner {
    orchestrator: SimulationOrchestrator,
    cancel: CancelSignal,
    event_callback: Option<BatchEventCallback>,
}

impl fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRunner")
            .field("orchestrator", &self.orchestrator)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl BatchRunner {
    pub fn new(
        assistant: Arc<dyn AgentAdapter>,
        counterpart: Arc<dyn AgentAdapter>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            orchestrator: SimulationOrchestrator::new(assistant, counterpart)?,
            cancel: CancelSignal::never(),
            event_callback: None,
        })
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receives every conversation event tagged with its example id.
    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&str, &SimulationEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub async fn run(
        &self,
        dataset: &[DatasetExample],
        max_turns: usize,
        evaluator: &Evaluator,
        concurrency: usize,
    ) -> BatchResult {
        let started_at = Utc::now();
        info!(
            examples = dataset.len(),
            max_turns,
            concurrency,
            grader = evaluator.policy_name(),
            "starting batch"
        );

        let mut indexed: Vec<(usize, ExampleResult)> = stream::iter(dataset.iter().enumerate())
            .map(|(index, example)| async move {
                (index, self.run_example(index, example, max_turns, evaluator).await)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<ExampleResult> = indexed.into_iter().map(|(_, result)| result).collect();
        let summary = BatchSummary::from_results(&results);

        info!(
            total = summary.total,
            passed = summary.passed_count,
            failed = summary.failed_count,
            ungraded = summary.ungraded_count,
            errors = summary.error_count,
            cancelled = summary.cancelled_count,
            "batch finished"
        );

        BatchResult {
            started_at,
            finished_at: Utc::now(),
            max_turns,
            grader: evaluator.policy_name().to_string(),
            results,
            summary,
        }
    }

    async fn run_example(
        &self,
        index: usize,
        example: &DatasetExample,
        max_turns: usize,
        evaluator: &Evaluator,
    ) -> ExampleResult {
        let example_id = example.example_id(index);
        let run = self
            .orchestrator_for(&example_id)
            .run_with_cancel(example, max_turns, self.cancel.clone())
            .await;

        let mut result = ExampleResult {
            example_id,
            status: ExampleStatus::Errored,
            termination_reason: run.termination_reason,
            turn_count: run.turn_count,
            transcript: run.transcript,
            passed: None,
            rationale: None,
            error: run.error.as_ref().map(ToString::to_string),
        };

        match run.termination_reason {
            TerminationReason::Cancelled => {
                result.status = ExampleStatus::Cancelled;
                return result;
            }
            TerminationReason::AdapterError => return result,
            TerminationReason::MaxTurnsReached | TerminationReason::CounterpartFinished => {}
        }

        match evaluator.evaluate(&example.instructions, &result.transcript).await {
            Ok(verdict) => {
                result.status = if verdict.passed {
                    ExampleStatus::Passed
                } else {
                    ExampleStatus::Failed
                };
                result.passed = Some(verdict.passed);
                result.rationale = Some(verdict.rationale);
            }
            Err(error) => {
                warn!(example = %result.example_id, %error, "evaluation failed");
                result.status = ExampleStatus::Ungraded;
                result.error = Some(error.to_string());
            }
        }

        result
    }

    fn orchestrator_for(&self, example_id: &str) -> SimulationOrchestrator {
        let callback: Option<EventCallback> = self.event_callback.as_ref().map(|callback| {
            let callback = Arc::clone(callback);
            let example_id = example_id.to_string();
            Arc::new(move |event: &SimulationEvent| callback(&example_id, event)) as EventCallback
        });

        self.orchestrator.clone().with_shared_callback(callback)
    }
}
