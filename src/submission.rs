//! Entry point used by evaluation harnesses.
//!
//! A harness asks for an agent tagged with its call id and then only relies on
//! `run(question) -> String`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{build_system_prompt, Agent, AgentSettings};
use crate::config::Config;
use crate::llm::{CompletionOptions, OpenRouterClient};
use crate::tools::ToolRegistry;

/// A configured agent ready to answer questions.
#[async_trait]
pub trait Submission: Send + Sync {
    async fn run(&self, question: &str) -> String;
}

#[async_trait]
impl Submission for Agent {
    async fn run(&self, question: &str) -> String {
        Agent::run(self, question).await
    }
}

/// Build the default agent from environment configuration.
pub fn create_submission(call_id: &str) -> anyhow::Result<Box<dyn Submission>> {
    let config = Config::from_env()?;
    create_submission_with_config(call_id, &config)
}

/// Build the default agent from explicit configuration.
pub fn create_submission_with_config(
    call_id: &str,
    config: &Config,
) -> anyhow::Result<Box<dyn Submission>> {
    let tools = ToolRegistry::pirls_toolbelt(config)?;
    let system_prompt = config
        .include_system_prompt
        .then(|| build_system_prompt(&tools, config.max_rows));

    let llm = OpenRouterClient::new(config.api_key.clone())
        .with_base_url(config.llm_base_url.clone())
        .with_options(CompletionOptions {
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
        })
        .with_call_id(call_id);

    tracing::info!(
        "Created submission {} with model {} and {} tools",
        call_id,
        config.default_model,
        tools.len()
    );

    let agent = Agent::new(
        system_prompt,
        tools,
        Arc::new(llm),
        AgentSettings::from_config(config),
    )
    .with_call_id(call_id);

    Ok(Box::new(agent))
}
