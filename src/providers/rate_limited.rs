use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, Semaphore, SemaphorePermit},
    time::{self, Instant},
};

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse},
    LLMError,
};

/// Shared budget for outbound calls. Clones share the same permits and pacing.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    min_interval: Option<Duration>,
    last_start: Arc<Mutex<Option<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            min_interval: None,
            last_start: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval).filter(|value| !value.is_zero());
        self
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn pace(&self) {
        let Some(interval) = self.min_interval else {
            return;
        };

        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + interval;
            if ready_at > Instant::now() {
                time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

pub struct RateLimitedProvider {
    inner: Arc<dyn LLMProvider>,
    limiter: RateLimiter,
}

impl RateLimitedProvider {
    pub fn new(inner: Arc<dyn LLMProvider>, limiter: RateLimiter) -> Self {
        Self { inner, limiter }
    }

    async fn admit(&self) -> Result<SemaphorePermit<'_>, LLMError> {
        let permit = self
            .limiter
            .permits
            .acquire()
            .await
            .map_err(|_| LLMError::RateLimiterClosed)?;
        self.limiter.pace().await;
        Ok(permit)
    }
}

#[async_trait]
impl LLMProvider for RateLimitedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let _permit = self.admit().await?;
        self.inner.complete(request).await
    }

    async fn complete_within(
        &self,
        request: CompletionRequest,
        deadline: Duration,
    ) -> Result<CompletionResponse, LLMError> {
        // The deadline starts once the permit is held.
        let _permit = self.admit().await?;
        self.inner.complete_within(request, deadline).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
