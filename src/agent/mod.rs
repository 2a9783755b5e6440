//! Agent module - the core tool-calling loop.
//!
//! The agent follows a "tools in a loop" pattern:
//! 1. Build context with the system prompt and the user question
//! 2. Call the LLM with the available tools
//! 3. If the LLM requests tool calls, execute them and feed the results back
//! 4. Repeat until the LLM produces a final answer or max iterations is reached

mod agent_loop;
mod conversation;
mod prompt;

pub use agent_loop::{
    Agent, AgentError, AgentSettings, RunOutcome, RunStats, UNKNOWN_TOOL_RESPONSE,
};
pub use conversation::{Conversation, ConversationError};
pub use prompt::{build_system_prompt, DEGRADED_RESPONSE};
