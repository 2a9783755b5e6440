//! Chart rendering through the QuickChart API.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::Tool;

/// Create a hosted chart image from a Chart.js configuration.
pub struct QuickChart {
    client: reqwest::Client,
    api_url: String,
}

impl QuickChart {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

/// Normalize the model's argument into a QuickChart request body.
///
/// Accepts the config directly, nested under `chart_input` (possibly more than
/// once), or JSON-encoded as a string. A bare Chart.js config is wrapped as
/// `{"chart": ...}`.
fn normalize_chart_input(args: Value) -> anyhow::Result<Map<String, Value>> {
    let mut input = args;
    loop {
        input = match input {
            Value::Object(mut map) if map.contains_key("chart_input") => {
                map.remove("chart_input").unwrap_or(Value::Null)
            }
            Value::String(s) => serde_json::from_str(&s).map_err(|_| {
                anyhow::anyhow!(
                    "Invalid input: chart_input string could not be parsed as a dictionary."
                )
            })?,
            other => break input_to_object(other),
        };
    }
}

fn input_to_object(input: Value) -> anyhow::Result<Map<String, Value>> {
    let Value::Object(map) = input else {
        return Err(anyhow::anyhow!(
            "Invalid input: chart_input must be a dictionary."
        ));
    };
    if map.is_empty() {
        return Err(anyhow::anyhow!(
            "Invalid input: chart_input cannot be an empty dictionary."
        ));
    }
    if map.contains_key("chart") {
        return Ok(map);
    }

    let mut wrapped = Map::new();
    wrapped.insert("chart".to_string(), Value::Object(map));
    Ok(wrapped)
}

#[async_trait]
impl Tool for QuickChart {
    fn name(&self) -> &str {
        "create_quickchart_url"
    }

    fn description(&self) -> &str {
        "Create a chart with the QuickChart API and return its URL. Pass a Chart.js configuration under 'chart' (type, data with labels and datasets, options), plus optional 'format' ('png' or 'svg'), 'width' and 'height'. Use for bar, line and pie charts of query results."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chart_input": {
                    "type": "object",
                    "description": "QuickChart request, e.g. {\"format\": \"png\", \"chart\": {\"type\": \"bar\", \"data\": {\"labels\": [...], \"datasets\": [{\"label\": \"...\", \"data\": [...]}]}}}"
                }
            },
            "required": ["chart_input"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let body = normalize_chart_input(args)?;

        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| anyhow::anyhow!("Request to QuickChart API failed: {}", e))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Request to QuickChart API failed: {}", e))?;

        match result.get("url").and_then(Value::as_str) {
            Some(url) => {
                tracing::debug!("Created chart: {}", url);
                Ok(url.to_string())
            }
            None => Err(anyhow::anyhow!("No URL returned by the QuickChart API.")),
        }
    }
}
