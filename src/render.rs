use std::fmt::Write;

use colored::Colorize;

use crate::types::{ChatMessage, MessageRole};

/// Formats transcripts for people (console) or for prompts (plain).
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptRenderer {
    colored: bool,
}

impl TranscriptRenderer {
    pub fn plain() -> Self {
        Self { colored: false }
    }

    pub fn colored() -> Self {
        Self { colored: true }
    }

    pub fn render(&self, messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        for message in messages {
            let label = label(message);
            let label = if self.colored {
                match message.role {
                    MessageRole::User => label.red().bold().to_string(),
                    MessageRole::Assistant => label.green().bold().to_string(),
                    MessageRole::System => label.dimmed().to_string(),
                }
            } else {
                label
            };
            let _ = writeln!(out, "{label}: {}", message.content);
        }
        out
    }
}

fn label(message: &ChatMessage) -> String {
    let role = match message.role {
        MessageRole::User => "USER",
        MessageRole::Assistant => "ASSISTANT",
        MessageRole::System => "SYSTEM",
    };
    match &message.name {
        Some(name) => format!("{role} ({name})"),
        None => role.to_string(),
    }
}

pub fn render_plain(messages: &[ChatMessage]) -> String {
    TranscriptRenderer::plain().render(messages)
}
