use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time;
use tracing::{debug, warn};

use crate::{
    providers::with_deadline,
    types::{ChatMessage, CompletionRequest, CompletionResponse, MessageError},
    LLMError, LLMProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{agent} did not respond within {deadline:?} after {attempts} attempt(s)")]
    Timeout {
        agent: String,
        attempts: u32,
        deadline: Duration,
    },
    #[error("{agent} returned an empty response")]
    EmptyResponse { agent: String },
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] MessageError),
    #[error("directive template error: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("{agent} is registered as {found} but was used as {expected}")]
    RoleMismatch {
        agent: String,
        expected: AgentRole,
        found: AgentRole,
    },
    #[error(transparent)]
    Provider(#[from] LLMError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// The agent under test; sees the canonical transcript.
    Assistant,
    /// The simulated user; sees the role-swapped transcript and may end the conversation.
    Counterpart,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Assistant => f.write_str("assistant"),
            AgentRole::Counterpart => f.write_str("counterpart"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AgentContext<'a> {
    pub instructions: &'a str,
    pub messages: &'a [ChatMessage],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Reply(String),
    /// The counterpart emitted the termination sentinel.
    Finished,
}

#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> AgentRole;

    async fn respond(&self, context: AgentContext<'_>) -> Result<AgentOutcome, AdapterError>;
}

/// Per-call deadline with bounded retries. Only timeouts are retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub call_timeout: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            call_timeout: Duration::from_secs(60),
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, call_timeout: Duration) -> Self {
        Self {
            max_retries,
            call_timeout,
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// `call` receives the per-attempt deadline and must enforce it, reporting an overrun as
    /// `LLMError::Timeout`; only those are retried.
    pub async fn run<T, F, Fut>(&self, agent: &str, mut call: F) -> Result<T, AdapterError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let attempts = self.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            match call(self.call_timeout).await {
                Err(LLMError::Timeout(_)) => {
                    warn!(agent, attempt, attempts, "adapter call timed out");
                    if attempt < attempts && !self.backoff.is_zero() {
                        time::sleep(self.backoff).await;
                    }
                }
                result => return result.map_err(AdapterError::from),
            }
        }

        Err(AdapterError::Timeout {
            agent: agent.to_string(),
            attempts,
            deadline: self.call_timeout,
        })
    }
}

pub(crate) fn reply_content(
    agent: &str,
    response: CompletionResponse,
) -> Result<String, AdapterError> {
    match response.content {
        Some(content) if !content.trim().is_empty() => Ok(content.trim().to_string()),
        _ => Err(AdapterError::EmptyResponse {
            agent: agent.to_string(),
        }),
    }
}

/// Assistant under test backed by a chat completion model.
#[derive(Clone)]
pub struct LlmAssistant {
    name: String,
    provider: Arc<dyn LLMProvider>,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    retry: RetryPolicy,
}

impl fmt::Debug for LlmAssistant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmAssistant")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("has_system_prompt", &self.system_prompt.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

impl LlmAssistant {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            name: "assistant".to_string(),
            provider,
            model: model.into(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(&self, history: &[ChatMessage]) -> CompletionRequest {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend(history.iter().cloned());

        let mut request = CompletionRequest::new(self.model.clone(), messages);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

#[async_trait]
impl AgentAdapter for LlmAssistant {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Assistant
    }

    async fn respond(&self, context: AgentContext<'_>) -> Result<AgentOutcome, AdapterError> {
        let request = self.build_request(context.messages);
        debug!(agent = %self.name, messages = request.messages.len(), "calling assistant model");

        let response = self
            .retry
            .run(&self.name, |deadline| {
                self.provider.complete_within(request.clone(), deadline)
            })
            .await?;

        reply_content(&self.name, response).map(AgentOutcome::Reply)
    }
}

type AssistantFn = dyn Fn(Vec<ChatMessage>) -> futures_util::future::BoxFuture<'static, Result<String, LLMError>>
    + Send
    + Sync;

/// Wraps any async function as the assistant under test.
#[derive(Clone)]
pub struct FnAssistant {
    name: String,
    handler: Arc<AssistantFn>,
    retry: RetryPolicy,
}

impl fmt::Debug for FnAssistant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAssistant")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish()
    }
}

impl FnAssistant {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<ChatMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, LLMError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |messages| Box::pin(handler(messages))),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl AgentAdapter for FnAssistant {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Assistant
    }

    async fn respond(&self, context: AgentContext<'_>) -> Result<AgentOutcome, AdapterError> {
        let content = self
            .retry
            .run(&self.name, |deadline| {
                with_deadline(deadline, (self.handler)(context.messages.to_vec()))
            })
            .await?;

        reply_content(&self.name, CompletionResponse::text(content)).map(AgentOutcome::Reply)
    }
}
