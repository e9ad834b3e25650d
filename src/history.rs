use crate::types::{ChatMessage, MessageError, MessageRole};

/// Append-only transcript of one conversation, stored from the assistant's perspective.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self { messages: Vec::new() }
    }

    pub fn append(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Result<&ChatMessage, MessageError> {
        self.push(ChatMessage::new(role, content))
    }

    pub fn push(&mut self, message: ChatMessage) -> Result<&ChatMessage, MessageError> {
        message.validate()?;
        self.messages.push(message);
        Ok(&self.messages[self.messages.len() - 1])
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> Result<&ChatMessage, MessageError> {
        self.append(MessageRole::User, content)
    }

    pub fn push_assistant(
        &mut self,
        content: impl Into<String>,
    ) -> Result<&ChatMessage, MessageError> {
        self.append(MessageRole::Assistant, content)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The same exchange as the simulated user sees it.
    pub fn counterpart_view(&self) -> Vec<ChatMessage> {
        swap_roles(&self.messages)
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChatMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// Swaps user and assistant roles; system messages pass through. Applying it twice is a no-op.
pub fn swap_roles(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages.iter().map(ChatMessage::mirrored).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChatHistory {
        let mut history = ChatHistory::new();
        history.push_user("Can I get a refund?").unwrap();
        history.push_assistant("Let me check your booking.").unwrap();
        history.push_user("Just give me the voucher code.").unwrap();
        history
    }

    #[test]
    fn counterpart_view_swaps_roles() {
        let history = sample();
        let view = history.counterpart_view();
        let roles: Vec<MessageRole> = view.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::Assistant, MessageRole::User, MessageRole::Assistant]
        );
        assert_eq!(view[1].content, "Let me check your booking.");
    }

    #[test]
    fn swap_is_an_involution() {
        let mut messages = sample().into_messages();
        messages.insert(0, ChatMessage::system("be brief"));
        assert_eq!(swap_roles(&swap_roles(&messages)), messages);
        assert_eq!(swap_roles(&messages)[0].role, MessageRole::System);
    }

    #[test]
    fn append_rejects_blank_content_without_touching_history() {
        let mut history = sample();
        let error = history.push_assistant("   ").unwrap_err();
        assert!(matches!(error, MessageError::EmptyContent { .. }));
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().map(ChatMessage::text), Some("Just give me the voucher code."));
    }

    #[test]
    fn append_preserves_order() {
        let history = sample();
        let contents: Vec<&str> = history.iter().map(ChatMessage::text).collect();
        assert_eq!(
            contents,
            vec![
                "Can I get a refund?",
                "Let me check your booking.",
                "Just give me the voucher code."
            ]
        );
    }
}
