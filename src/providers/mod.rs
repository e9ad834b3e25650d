use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio::time;

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod openai;
pub mod rate_limited;
pub mod scripted;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    /// Like `complete`, but fails with `LLMError::Timeout` once the service has taken longer
    /// than `deadline`. Time spent queueing in front of the service is not counted.
    async fn complete_within(
        &self,
        request: CompletionRequest,
        deadline: Duration,
    ) -> Result<CompletionResponse, LLMError> {
        with_deadline(deadline, self.complete(request)).await
    }

    fn name(&self) -> &'static str;
}

pub(crate) async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, LLMError>
where
    F: Future<Output = Result<T, LLMError>>,
{
    time::timeout(deadline, call)
        .await
        .unwrap_or(Err(LLMError::Timeout(deadline)))
}
