//! Core agent loop implementation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tracing::Instrument;

use crate::config::Config;
use crate::llm::{ChatMessage, LlmClient, LlmError, ToolCall};
use crate::tools::{truncate_output, ToolRegistry};

use super::conversation::{Conversation, ConversationError};
use super::prompt::DEGRADED_RESPONSE;

/// Tool result fed back when the model names a tool that is not registered.
pub const UNKNOWN_TOOL_RESPONSE: &str = "bad tool name, retry";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Model client failed: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error("Max iterations ({0}) reached without completion")]
    MaxIterations(usize),
}

/// Per-agent knobs.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,

    /// Model invocations allowed per run
    pub max_iterations: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.default_model.clone(),
            max_iterations: config.max_iterations,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Model invocations
    pub iterations: usize,

    /// Registered tools that were executed
    pub tool_calls: usize,

    pub unknown_tools: usize,
}

/// Result of a run that reached a final answer.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub answer: String,
    pub stats: RunStats,
    pub conversation: Conversation,
}

/// The tool-calling agent.
///
/// Holds everything a run needs; nothing is shared between runs, so several
/// agents with different prompts, tools or models can coexist.
pub struct Agent {
    system_prompt: Option<String>,
    tools: ToolRegistry,
    llm: Arc<dyn LlmClient>,
    settings: AgentSettings,
    call_id: Option<String>,
}

impl Agent {
    pub fn new(
        system_prompt: Option<String>,
        tools: ToolRegistry,
        llm: Arc<dyn LlmClient>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            system_prompt,
            tools,
            llm,
            settings,
            call_id: None,
        }
    }

    /// Tag log output of every run with a caller-supplied id.
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Answer a question. Never fails: any error or panic inside the loop
    /// yields [`DEGRADED_RESPONSE`].
    pub async fn run(&self, question: &str) -> String {
        let span = tracing::info_span!(
            "agent_run",
            call_id = self.call_id.as_deref().unwrap_or("-")
        );

        let result = AssertUnwindSafe(self.run_loop(question))
            .catch_unwind()
            .instrument(span)
            .await;

        match result {
            Ok(Ok(outcome)) => outcome.answer,
            Ok(Err(e)) => {
                tracing::warn!("Agent run failed, returning fallback answer: {}", e);
                DEGRADED_RESPONSE.to_string()
            }
            Err(_) => {
                tracing::error!("Agent run panicked, returning fallback answer");
                DEGRADED_RESPONSE.to_string()
            }
        }
    }

    /// The raw loop, surfacing the error that [`Agent::run`] hides.
    pub async fn run_loop(&self, question: &str) -> Result<RunOutcome, AgentError> {
        let mut conversation = Conversation::new(self.system_prompt.as_deref(), question);
        let mut stats = RunStats::default();

        let schemas = self.tools.get_tool_schemas();
        let tool_schemas = if schemas.is_empty() {
            None
        } else {
            Some(schemas.as_slice())
        };

        for iteration in 0..self.settings.max_iterations {
            stats.iterations = iteration + 1;
            tracing::debug!("Agent iteration {}", stats.iterations);

            let response = self
                .llm
                .chat_completion(&self.settings.model, conversation.messages(), tool_schemas)
                .await?;

            let message = response.into_message();
            let calls = message.requested_tools().to_vec();
            conversation.push_model(message)?;

            if calls.is_empty() {
                let answer = conversation
                    .last()
                    .and_then(|m| m.content.clone())
                    .unwrap_or_default();
                tracing::info!(
                    "Final answer after {} iterations and {} tool calls",
                    stats.iterations,
                    stats.tool_calls
                );
                return Ok(RunOutcome {
                    answer,
                    stats,
                    conversation,
                });
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let content = self.dispatch(call, &mut stats).await;
                results.push(ChatMessage::tool_result(
                    &call.id,
                    &call.function.name,
                    content,
                ));
            }
            conversation.push_tool_results(results)?;
        }

        Err(AgentError::MaxIterations(self.settings.max_iterations))
    }

    /// Execute one tool call and return the text fed back to the model.
    async fn dispatch(&self, call: &ToolCall, stats: &mut RunStats) -> String {
        let name = call.function.name.as_str();
        let Some(tool) = self.tools.get(name) else {
            stats.unknown_tools += 1;
            tracing::warn!("Model requested unknown tool '{}'", name);
            return UNKNOWN_TOOL_RESPONSE.to_string();
        };

        stats.tool_calls += 1;
        tracing::info!(
            "Calling tool: {} with args: {}",
            name,
            truncate_output(&call.function.arguments, 500)
        );

        let content = match tool.execute(call.parse_arguments()).await {
            Ok(output) => output,
            Err(e) => format!("Error: {}", e),
        };

        tracing::debug!("Tool {} returned: {}", name, truncate_output(&content, 1000));
        content
    }
}
