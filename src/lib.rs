//! # PIRLS Agent
//!
//! A tool-calling LLM agent that answers questions about the PIRLS 2021
//! reading-literacy study.
//!
//! This library provides:
//! - A tool-based agent loop with a degraded-mode fallback
//! - Research tools over the PIRLS SQL database, PIRLS publications
//!   (PDF, Excel, CSV, web pages) and the UNESCO statistics API
//! - Statistics and chart tools
//! - Integration with OpenRouter (or any OpenAI-compatible endpoint)
//!
//! ## Architecture
//!
//! The agent follows the "tools in a loop" pattern:
//! 1. Seed the conversation with the system prompt and the question
//! 2. Call the LLM with the tool catalog
//! 3. Execute any requested tool calls and feed the results back
//! 4. Repeat until the LLM answers without tool calls
//!
//! ## Example
//!
//! ```rust,ignore
//! use pirls_agent::submission::create_submission;
//!
//! let agent = create_submission("call-1")?;
//! let answer = agent.run("What is the average reading score in Egypt?").await;
//! ```

pub mod agent;
pub mod config;
pub mod llm;
pub mod submission;
pub mod tools;

pub use config::Config;
