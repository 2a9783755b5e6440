//! Append-only message history for one agent run.

use thiserror::Error;

use crate::llm::{ChatMessage, Role};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("Expected a model message, got {0:?}")]
    NotAModelMessage(Role),

    #[error("Tool results do not answer the preceding model message (expected ids {expected:?}, got {actual:?})")]
    UnmatchedToolResults {
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

/// Ordered messages of a single run.
///
/// Seeded with an optional system message and the question; afterwards only
/// model turns and complete batches of tool results can be appended. A batch
/// must answer every call of the model message right before it, in order.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(system_prompt: Option<&str>, question: &str) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        messages.push(ChatMessage::user(question));
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn push_model(&mut self, message: ChatMessage) -> Result<(), ConversationError> {
        if message.role != Role::Assistant {
            return Err(ConversationError::NotAModelMessage(message.role));
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn push_tool_results(&mut self, results: Vec<ChatMessage>) -> Result<(), ConversationError> {
        let expected: Vec<String> = self
            .messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.requested_tools().iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default();
        let actual: Vec<String> = results
            .iter()
            .map(|r| {
                if r.role == Role::Tool {
                    r.tool_call_id.clone().unwrap_or_default()
                } else {
                    String::new()
                }
            })
            .collect();

        if expected.is_empty() || expected != actual {
            return Err(ConversationError::UnmatchedToolResults { expected, actual });
        }
        self.messages.extend(results);
        Ok(())
    }
}
