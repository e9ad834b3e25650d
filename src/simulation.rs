use std::{collections::VecDeque, fmt, pin::Pin, sync::Arc};

use async_stream::stream;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    agents::{AdapterError, AgentAdapter, AgentContext, AgentOutcome, AgentRole},
    dataset::DatasetExample,
    history::ChatHistory,
    types::{ChatMessage, MessageError, MessageRole},
};

pub type SimulationStream = Pin<Box<dyn Stream<Item = SimulationUpdate> + Send>>;

pub(crate) type EventCallback = Arc<dyn Fn(&SimulationEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxTurnsReached,
    CounterpartFinished,
    AdapterError,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminationReason::MaxTurnsReached => "max_turns_reached",
            TerminationReason::CounterpartFinished => "counterpart_finished",
            TerminationReason::AdapterError => "adapter_error",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Init,
    AssistantTurn,
    UserTurn,
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Terminated,
}

/// Everything one conversation owns while it runs.
#[derive(Debug, Clone)]
pub struct ConversationState {
    history: ChatHistory,
    turn_count: usize,
    instructions: String,
    state: TurnState,
}

impl ConversationState {
    fn new(instructions: impl Into<String>) -> Self {
        Self {
            history: ChatHistory::new(),
            turn_count: 0,
            instructions: instructions.into(),
            state: TurnState::Init,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.history.messages()
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn turn_state(&self) -> TurnState {
        self.state
    }

    pub fn status(&self) -> ConversationStatus {
        match self.state {
            TurnState::Terminated(_) => ConversationStatus::Terminated,
            _ => ConversationStatus::Active,
        }
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        match self.state {
            TurnState::Terminated(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulationEvent {
    Seeded {
        message: ChatMessage,
    },
    Message {
        role: MessageRole,
        agent: String,
        content: String,
        turn_count: usize,
    },
    Terminated {
        reason: TerminationReason,
        turn_count: usize,
        error: Option<String>,
    },
}

impl SimulationEvent {
    pub fn role(&self) -> Option<MessageRole> {
        match self {
            SimulationEvent::Seeded { message } => Some(message.role),
            SimulationEvent::Message { role, .. } => Some(*role),
            SimulationEvent::Terminated { .. } => None,
        }
    }
}

/// One streamed transition with the transcript as it stood right after it.
#[derive(Debug, Clone)]
pub struct SimulationUpdate {
    pub event: SimulationEvent,
    pub snapshot: Vec<ChatMessage>,
}

#[derive(Debug)]
pub struct SimulationRun {
    pub transcript: Vec<ChatMessage>,
    pub turn_count: usize,
    pub termination_reason: TerminationReason,
    pub error: Option<AdapterError>,
    pub events: Vec<SimulationEvent>,
}

/// Receiving side of a cancellation request. Clones observe the same request.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

enum Interrupted {
    Cancelled,
    Adapter(AdapterError),
}

/// Drives one assistant/counterpart pairing through conversations.
#[derive(Clone)]
pub struct SimulationOrchestrator {
    assistant: Arc<dyn AgentAdapter>,
    counterpart: Arc<dyn AgentAdapter>,
    event_callback: Option<EventCallback>,
}

impl fmt::Debug for SimulationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationOrchestrator")
            .field("assistant", &self.assistant.name())
            .field("counterpart", &self.counterpart.name())
            .field("has_event_callback", &self.event_callback.is_some())
            .finish()
    }
}

impl SimulationOrchestrator {
    pub fn new(
        assistant: Arc<dyn AgentAdapter>,
        counterpart: Arc<dyn AgentAdapter>,
    ) -> Result<Self, AdapterError> {
        check_role(assistant.as_ref(), AgentRole::Assistant)?;
        check_role(counterpart.as_ref(), AgentRole::Counterpart)?;

        Ok(Self {
            assistant,
            counterpart,
            event_callback: None,
        })
    }

    /// Telemetry sink. Runs inline on the conversation task, in event order, before the
    /// transition returns, so it must not block; hand slow work off to a channel. Panics are
    /// caught and never change the outcome.
    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&SimulationEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub(crate) fn with_shared_callback(mut self, callback: Option<EventCallback>) -> Self {
        self.event_callback = callback;
        self
    }

    pub fn session(&self, example: &DatasetExample, max_turns: usize) -> SimulationSession {
        self.session_with_cancel(example, max_turns, CancelSignal::never())
    }

    pub fn session_with_cancel(
        &self,
        example: &DatasetExample,
        max_turns: usize,
        cancel: CancelSignal,
    ) -> SimulationSession {
        SimulationSession {
            assistant: Arc::clone(&self.assistant),
            counterpart: Arc::clone(&self.counterpart),
            event_callback: self.event_callback.clone(),
            state: ConversationState::new(example.instructions.clone()),
            seed: example.input.clone(),
            max_turns,
            cancel,
            error: None,
            events: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub async fn run(&self, example: &DatasetExample, max_turns: usize) -> SimulationRun {
        self.run_with_cancel(example, max_turns, CancelSignal::never())
            .await
    }

    pub async fn run_with_cancel(
        &self,
        example: &DatasetExample,
        max_turns: usize,
        cancel: CancelSignal,
    ) -> SimulationRun {
        let mut session = self.session_with_cancel(example, max_turns, cancel);
        while session.advance().await.is_some() {}
        session.into_run()
    }

    pub fn stream(&self, example: &DatasetExample, max_turns: usize) -> SimulationStream {
        self.stream_with_cancel(example, max_turns, CancelSignal::never())
    }

    pub fn stream_with_cancel(
        &self,
        example: &DatasetExample,
        max_turns: usize,
        cancel: CancelSignal,
    ) -> SimulationStream {
        let mut session = self.session_with_cancel(example, max_turns, cancel);
        Box::pin(stream! {
            while let Some(event) = session.advance().await {
                let snapshot = session.state().messages().to_vec();
                yield SimulationUpdate { event, snapshot };
            }
        })
    }
}

fn check_role(adapter: &dyn AgentAdapter, expected: AgentRole) -> Result<(), AdapterError> {
    if adapter.role() != expected {
        return Err(AdapterError::RoleMismatch {
            agent: adapter.name().to_string(),
            expected,
            found: adapter.role(),
        });
    }
    Ok(())
}

/// A single conversation execution. Not restartable: once terminated it only drains.
pub struct SimulationSession {
    assistant: Arc<dyn AgentAdapter>,
    counterpart: Arc<dyn AgentAdapter>,
    event_callback: Option<EventCallback>,
    state: ConversationState,
    seed: String,
    max_turns: usize,
    cancel: CancelSignal,
    error: Option<AdapterError>,
    events: Vec<SimulationEvent>,
    pending: VecDeque<SimulationEvent>,
}

impl SimulationSession {
    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Returns the next event, performing one state transition when none is queued.
    pub async fn advance(&mut self) -> Option<SimulationEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        if self.state.status() == ConversationStatus::Terminated {
            return None;
        }

        self.transition().await;
        self.pending.pop_front()
    }

    pub fn into_run(self) -> SimulationRun {
        let termination_reason = self
            .state
            .termination_reason()
            .unwrap_or(TerminationReason::Cancelled);

        SimulationRun {
            turn_count: self.state.turn_count,
            termination_reason,
            error: self.error,
            events: self.events,
            transcript: self.state.history.into_messages(),
        }
    }

    async fn transition(&mut self) {
        match self.state.state {
            TurnState::Init => self.seed(),
            TurnState::AssistantTurn => self.assistant_turn().await,
            TurnState::UserTurn => self.user_turn().await,
            TurnState::Terminated(_) => {}
        }
    }

    fn seed(&mut self) {
        let message = match self.state.history.push_user(self.seed.clone()) {
            Ok(message) => message.clone(),
            Err(error) => {
                self.terminate(TerminationReason::AdapterError, Some(error.into()));
                return;
            }
        };

        self.record(SimulationEvent::Seeded { message });

        if self.max_turns == 0 {
            self.terminate(TerminationReason::MaxTurnsReached, None);
        } else {
            self.state.state = TurnState::AssistantTurn;
        }
    }

    async fn assistant_turn(&mut self) {
        let messages = self.state.history.messages().to_vec();
        let adapter = Arc::clone(&self.assistant);

        match self.call(adapter.as_ref(), &messages).await {
            Ok(AgentOutcome::Reply(content)) => {
                self.relay(adapter.name(), MessageRole::Assistant, content, TurnState::UserTurn)
            }
            Ok(AgentOutcome::Finished) => self.terminate(
                TerminationReason::AdapterError,
                Some(MessageError::UnexpectedTermination.into()),
            ),
            Err(Interrupted::Cancelled) => self.terminate(TerminationReason::Cancelled, None),
            Err(Interrupted::Adapter(error)) => {
                self.terminate(TerminationReason::AdapterError, Some(error))
            }
        }
    }

    async fn user_turn(&mut self) {
        let view = self.state.history.counterpart_view();
        let adapter = Arc::clone(&self.counterpart);

        match self.call(adapter.as_ref(), &view).await {
            Ok(AgentOutcome::Reply(content)) => {
                self.relay(adapter.name(), MessageRole::User, content, TurnState::AssistantTurn)
            }
            Ok(AgentOutcome::Finished) => {
                self.terminate(TerminationReason::CounterpartFinished, None)
            }
            Err(Interrupted::Cancelled) => self.terminate(TerminationReason::Cancelled, None),
            Err(Interrupted::Adapter(error)) => {
                self.terminate(TerminationReason::AdapterError, Some(error))
            }
        }
    }

    async fn call(
        &self,
        adapter: &dyn AgentAdapter,
        messages: &[ChatMessage],
    ) -> Result<AgentOutcome, Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }

        debug!(
            agent = adapter.name(),
            role = %adapter.role(),
            turn = self.state.turn_count,
            "requesting turn"
        );

        let context = AgentContext {
            instructions: &self.state.instructions,
            messages,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            outcome = adapter.respond(context) => outcome.map_err(Interrupted::Adapter),
        }
    }

    fn relay(&mut self, agent: &str, role: MessageRole, content: String, next: TurnState) {
        let message = ChatMessage::new(role, content).with_name(agent);
        if let Err(error) = self.state.history.push(message) {
            self.terminate(TerminationReason::AdapterError, Some(error.into()));
            return;
        }

        self.state.turn_count += 1;
        let content = self
            .state
            .history
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.record(SimulationEvent::Message {
            role,
            agent: agent.to_string(),
            content,
            turn_count: self.state.turn_count,
        });

        if self.state.turn_count >= self.max_turns {
            self.terminate(TerminationReason::MaxTurnsReached, None);
        } else {
            self.state.state = next;
        }
    }

    fn terminate(&mut self, reason: TerminationReason, error: Option<AdapterError>) {
        if self.state.status() == ConversationStatus::Terminated {
            return;
        }

        self.state.state = TurnState::Terminated(reason);
        match &error {
            Some(error) => warn!(%reason, turns = self.state.turn_count, %error, "conversation failed"),
            None => info!(%reason, turns = self.state.turn_count, "conversation terminated"),
        }

        self.record(SimulationEvent::Terminated {
            reason,
            turn_count: self.state.turn_count,
            error: error.as_ref().map(ToString::to_string),
        });
        self.error = error;
    }

    fn record(&mut self, event: SimulationEvent) {
        if let Some(callback) = &self.event_callback {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (callback)(&event)));
            if outcome.is_err() {
                warn!("simulation event callback panicked; event dropped by sink");
            }
        }

        self.events.push(event.clone());
        self.pending.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Mutex, MutexGuard},
        time::Duration,
    };

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use super::*;
    use crate::LLMError;

    enum Step {
        Reply(&'static str),
        Finish,
        Fail,
        Hang,
    }

    struct TestAgent {
        role: AgentRole,
        steps: Mutex<VecDeque<Step>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl TestAgent {
        fn new(role: AgentRole, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                role,
                steps: Mutex::new(steps.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> MutexGuard<'_, Vec<Vec<ChatMessage>>> {
            self.seen.lock().unwrap()
        }
    }

    #[async_trait]
    impl AgentAdapter for TestAgent {
        fn name(&self) -> &str {
            match self.role {
                AgentRole::Assistant => "bot",
                AgentRole::Counterpart => "sim",
            }
        }

        fn role(&self) -> AgentRole {
            self.role
        }

        async fn respond(&self, context: AgentContext<'_>) -> Result<AgentOutcome, AdapterError> {
            self.seen.lock().unwrap().push(context.messages.to_vec());
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Reply("again"));
            match step {
                Step::Reply(text) => Ok(AgentOutcome::Reply(text.to_string())),
                Step::Finish => Ok(AgentOutcome::Finished),
                Step::Fail => Err(AdapterError::Provider(LLMError::Provider("down".into()))),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(AgentOutcome::Reply("never".to_string()))
                }
            }
        }
    }

    fn example() -> DatasetExample {
        DatasetExample::new("I want a refund", "Get a refund for a non-refundable ticket")
    }

    fn orchestrator(assistant: Arc<TestAgent>, counterpart: Arc<TestAgent>) -> SimulationOrchestrator {
        SimulationOrchestrator::new(assistant, counterpart).expect("roles match")
    }

    #[tokio::test]
    async fn adapters_see_their_own_perspective() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Reply("How can I help?")]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![Step::Finish]);
        let run = orchestrator(bot.clone(), sim.clone()).run(&example(), 10).await;

        assert_eq!(run.termination_reason, TerminationReason::CounterpartFinished);
        assert_eq!(bot.seen()[0][0].role, MessageRole::User);
        let counterpart_view = &sim.seen()[0];
        assert_eq!(counterpart_view[0].role, MessageRole::Assistant);
        assert_eq!(counterpart_view[1].role, MessageRole::User);
        assert_eq!(counterpart_view[1].content, "How can I help?");
    }

    #[tokio::test]
    async fn zero_max_turns_never_calls_adapters() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![]);
        let run = orchestrator(bot.clone(), sim).run(&example(), 0).await;

        assert_eq!(run.termination_reason, TerminationReason::MaxTurnsReached);
        assert_eq!(run.transcript.len(), 1);
        assert_eq!(run.turn_count, 0);
        assert!(bot.seen().is_empty());
    }

    #[tokio::test]
    async fn blank_seed_is_malformed() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![]);
        let run = orchestrator(bot, sim)
            .run(&DatasetExample::new("   ", "anything"), 4)
            .await;

        assert_eq!(run.termination_reason, TerminationReason::AdapterError);
        assert!(matches!(run.error, Some(AdapterError::MalformedMessage(_))));
        assert!(run.transcript.is_empty());
    }

    #[tokio::test]
    async fn assistant_cannot_finish_the_conversation() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Finish]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![]);
        let run = orchestrator(bot, sim).run(&example(), 4).await;

        assert_eq!(run.termination_reason, TerminationReason::AdapterError);
        assert!(matches!(
            run.error,
            Some(AdapterError::MalformedMessage(MessageError::UnexpectedTermination))
        ));
    }

    #[test]
    fn rejects_swapped_roles() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![]);
        let error = SimulationOrchestrator::new(sim, bot).unwrap_err();
        assert!(matches!(
            error,
            AdapterError::RoleMismatch {
                expected: AgentRole::Assistant,
                found: AgentRole::Counterpart,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_preserves_transcript() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Reply("Hello"), Step::Hang]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![Step::Reply("Refund me")]);
        let orchestrator = orchestrator(bot, sim);
        let (handle, signal) = cancellation();

        let run = tokio::spawn(async move {
            orchestrator.run_with_cancel(&example(), 10, signal).await
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
        let run = run.await.unwrap();

        assert_eq!(run.termination_reason, TerminationReason::Cancelled);
        assert!(run.error.is_none());
        assert_eq!(run.transcript.len(), 3);
        assert_eq!(run.turn_count, 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_keeps_only_the_seed() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![]);
        let (handle, signal) = cancellation();
        handle.cancel();

        let run = orchestrator(bot.clone(), sim)
            .run_with_cancel(&example(), 4, signal)
            .await;
        assert_eq!(run.termination_reason, TerminationReason::Cancelled);
        assert_eq!(run.transcript.len(), 1);
        assert!(bot.seen().is_empty());
    }

    #[tokio::test]
    async fn panicking_callback_does_not_change_outcome() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Reply("Hi")]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![Step::Finish]);
        let run = orchestrator(bot, sim)
            .with_event_callback(|_event| panic!("sink offline"))
            .run(&example(), 6)
            .await;

        assert_eq!(run.termination_reason, TerminationReason::CounterpartFinished);
        assert_eq!(run.events.len(), 3);
    }

    #[tokio::test]
    async fn stream_yields_snapshots_and_ends() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Reply("a1"), Step::Reply("a2")]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![Step::Reply("u1"), Step::Reply("u2")]);
        let updates: Vec<SimulationUpdate> =
            orchestrator(bot, sim).stream(&example(), 3).collect().await;

        let sizes: Vec<usize> = updates.iter().map(|update| update.snapshot.len()).collect();
        assert_eq!(sizes, vec![1, 2, 3, 4, 4]);
        assert_eq!(updates[1].event.role(), Some(MessageRole::Assistant));
        assert_eq!(updates[2].event.role(), Some(MessageRole::User));
        assert!(matches!(
            updates.last().map(|update| &update.event),
            Some(SimulationEvent::Terminated {
                reason: TerminationReason::MaxTurnsReached,
                turn_count: 3,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn session_drains_after_termination() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Fail]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![]);
        let mut session = orchestrator(bot, sim).session(&example(), 4);

        while session.advance().await.is_some() {}
        assert_eq!(session.state().status(), ConversationStatus::Terminated);
        assert!(session.advance().await.is_none());

        let run = session.into_run();
        assert_eq!(run.termination_reason, TerminationReason::AdapterError);
        assert_eq!(run.transcript.len(), 1);
    }

    #[tokio::test]
    async fn session_steps_one_transition_at_a_time() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Reply("Which flight?")]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![Step::Finish]);
        let mut session = orchestrator(bot, sim).session(&example(), 6);
        assert_eq!(session.state().turn_state(), TurnState::Init);

        assert!(matches!(session.advance().await, Some(SimulationEvent::Seeded { .. })));
        assert_eq!(session.state().turn_state(), TurnState::AssistantTurn);
        assert_eq!(session.state().history().len(), 1);

        assert!(matches!(session.advance().await, Some(SimulationEvent::Message { turn_count: 1, .. })));
        assert_eq!(session.state().turn_state(), TurnState::UserTurn);
        assert_eq!(
            session.state().history().last().map(|m| m.content.as_str()),
            Some("Which flight?")
        );

        assert!(matches!(session.advance().await, Some(SimulationEvent::Terminated { .. })));
        assert_eq!(
            session.state().turn_state(),
            TurnState::Terminated(TerminationReason::CounterpartFinished)
        );
        assert_eq!(session.state().history().len(), 2);
    }

    #[tokio::test]
    async fn callback_observes_each_event_before_the_step_returns() {
        let bot = TestAgent::new(AgentRole::Assistant, vec![Step::Reply("Hi")]);
        let sim = TestAgent::new(AgentRole::Counterpart, vec![Step::Finish]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut session = orchestrator(bot, sim)
            .with_event_callback(move |event| sink.lock().unwrap().push(event.clone()))
            .session(&example(), 6);

        let mut returned = Vec::new();
        while let Some(event) = session.advance().await {
            assert_eq!(seen.lock().unwrap().last(), Some(&event));
            returned.push(event);
        }
        assert_eq!(*seen.lock().unwrap(), returned);
    }
}
