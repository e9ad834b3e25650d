pub mod error;
pub mod providers;
pub mod types;
pub mod history;
pub mod agents;
pub mod simulated_user;
pub mod simulation;
pub mod evaluator;
pub mod dataset;
pub mod runner;
pub mod config;
pub mod render;

pub use error::LLMError;
pub use providers::LLMProvider;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, MessageError, MessageRole, TokenUsage,
};
pub use history::{swap_roles, ChatHistory};
pub use agents::{
    AdapterError,
    AgentAdapter,
    AgentContext,
    AgentOutcome,
    AgentRole,
    FnAssistant,
    LlmAssistant,
    RetryPolicy,
};
pub use simulated_user::{is_termination, SimulatedUser, DEFAULT_SENTINEL};
pub use simulation::{
    cancellation,
    CancelHandle,
    CancelSignal,
    ConversationState,
    ConversationStatus,
    SimulationEvent,
    SimulationOrchestrator,
    SimulationRun,
    SimulationSession,
    SimulationStream,
    SimulationUpdate,
    TerminationReason,
    TurnState,
};
pub use evaluator::{
    EvaluationError,
    EvaluationResult,
    Evaluator,
    GradingPolicy,
    LeakagePolicy,
    LlmJudge,
};
pub use dataset::{load_dataset, parse_dataset_str, DatasetError, DatasetExample};
pub use runner::{BatchResult, BatchRunner, BatchSummary, ExampleResult, ExampleStatus};
pub use config::{ConfigError, SimulationConfig};
pub use render::{render_plain, TranscriptRenderer};
