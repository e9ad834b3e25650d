use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse},
    LLMError,
};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// A response that carries no content field at all.
    Missing,
    Error(String),
    Delayed(Duration, String),
}

/// Replays a fixed list of replies in order and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_replies<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_replies(texts.into_iter().map(|text| ScriptedReply::Text(text.into())))
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        lock(&self.requests).push(request);
        let next = lock(&self.replies).pop_front();

        match next {
            Some(ScriptedReply::Text(text)) => Ok(CompletionResponse::text(text)),
            Some(ScriptedReply::Missing) => Ok(CompletionResponse {
                content: None,
                usage: None,
            }),
            Some(ScriptedReply::Error(message)) => Err(LLMError::Provider(message)),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(CompletionResponse::text(text))
            }
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
