//! Tool system: the capability interface and the name-keyed registry.
//!
//! Every tool takes a JSON argument object and returns text for the model.
//! Expected failures (bad input, unreachable resource, malformed data) come
//! back as `Err` and are fed to the model as `"Error: ..."` content; they are
//! never a control-flow exception for the agent loop.

pub mod chart;
pub mod database;
pub mod pdf;
pub mod plot;
pub mod stats;
pub mod storage;
pub mod tabular;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::llm::{FunctionSchema, ToolSchema};

/// User agent sent by every HTTP-backed tool.
pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; PirlsAgent/0.3)";

/// A capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name exposed to the model.
    fn name(&self) -> &str;

    /// When the model should reach for this tool.
    fn description(&self) -> &str;

    /// JSON Schema of the argument object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. `Err` is reported back to the model, not raised.
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
}

/// Name and description of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool '{0}' is registered more than once")]
    DuplicateTool(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// Immutable name → tool mapping, built once per agent.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Declaration order, used for the catalog sent to the model.
    order: Vec<String>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a declared list. Names must be unique.
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for tool in tools {
            let name = tool.name().to_string();
            if registry.tools.contains_key(&name) {
                return Err(RegistryError::DuplicateTool(name));
            }
            registry.order.push(name.clone());
            registry.tools.insert(name, tool);
        }
        Ok(registry)
    }

    /// The default toolbelt: database researcher, file ingestion, statistics,
    /// charts and web retrieval. The plot upload tools are only registered when
    /// object storage is configured.
    pub fn pirls_toolbelt(config: &Config) -> anyhow::Result<Self> {
        let http = http_client(Duration::from_secs(config.http_timeout_secs))?;
        let backend: Arc<dyn database::SqlBackend> =
            Arc::new(database::SqliteBackend::new(config.database_path.clone()));

        let mut tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(database::QueryDatabase::new(backend.clone(), config.max_rows)),
            Arc::new(database::GetPossibleAnswers::new(backend.clone())),
            Arc::new(database::GetQuestionsOfType::new(backend)),
            Arc::new(tabular::CsvToJson::new(http.clone())),
            Arc::new(tabular::FirstSheetToJson::new(http.clone())),
            Arc::new(pdf::TopParagraphsFromPdf::new(http.clone())),
            Arc::new(pdf::TablesFromPdf::new(http.clone())),
            Arc::new(stats::PearsonMultiple),
            Arc::new(stats::QuantileRegressionMultiple),
            Arc::new(chart::QuickChart::new(
                http.clone(),
                config.quickchart_url.clone(),
            )),
            Arc::new(web::CrawlSubpages::new(http.clone())),
            Arc::new(web::ScrapeText::new(http.clone())),
            Arc::new(web::FindRelevantLinks::new(http.clone())),
            Arc::new(web::UnescoData::new(http.clone(), config.unesco_api_url.clone())),
        ];

        match &config.storage {
            Some(storage_config) => {
                let store: Arc<dyn storage::ObjectStore> =
                    Arc::new(storage::S3Store::new(storage_config.clone(), http));
                tools.push(Arc::new(plot::CustomPlotToS3::new(store.clone(), &config.plot)));
                tools.push(Arc::new(plot::FlexiblePlotToS3::new(store, &config.plot)));
            }
            None => tracing::info!("S3_BUCKET not set; plot upload tools disabled"),
        }

        Ok(Self::from_tools(tools)?)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Registered names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.ordered()
            .map(|tool| ToolInfo {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect()
    }

    /// Catalog in OpenAI function-calling format.
    pub fn get_tool_schemas(&self) -> Vec<ToolSchema> {
        self.ordered()
            .map(|tool| ToolSchema {
                tool_type: "function".to_string(),
                function: FunctionSchema {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))?;
        tool.execute(args).await
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.order.iter().filter_map(|name| self.tools.get(name))
    }
}

/// Shared HTTP client for tools.
pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

/// Fetch a URL and return the body bytes, failing on non-2xx statuses.
pub(crate) async fn fetch_bytes(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow::anyhow!("HTTP error: {}", status));
    }
    Ok(response.bytes().await?.to_vec())
}

/// Truncate tool output to `max_len` bytes on a char boundary.
pub(crate) fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [output truncated]", &s[..end])
}
