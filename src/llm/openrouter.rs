//! OpenAI-compatible chat completions client (OpenRouter by default).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatResponse, LlmClient, LlmError, ToolCall, ToolSchema, Usage};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Sampling knobs forwarded to the provider unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI protocol.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    options: CompletionOptions,
    call_id: Option<String>,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolSchema]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            options: CompletionOptions::default(),
            call_id: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Tag every request with the evaluation call identifier.
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolSchema]>,
    ) -> Result<ChatResponse, LlmError> {
        let body = ChatCompletionRequest {
            model,
            messages,
            tools: tools.filter(|t| !t.is_empty()),
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
        };

        let mut request = self
            .client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "pirls-agent")
            .json(&body);
        if let Some(call_id) = &self.call_id {
            request = request.header("X-Call-Id", call_id);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&response.text().await?)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?;

        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                "Model usage: prompt={} completion={}",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls,
            finish_reason: choice.finish_reason,
            usage: parsed.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn builder_sets_fields() {
        let client = OpenRouterClient::new("key")
            .with_base_url("https://example.test/v1/")
            .with_call_id("call-1")
            .with_options(CompletionOptions {
                temperature: Some(0.0),
                max_tokens: Some(8192),
            });
        assert_eq!(client.completions_url(), "https://example.test/v1/chat/completions");
        assert_eq!(client.call_id.as_deref(), Some("call-1"));
        assert_eq!(client.options.max_tokens, Some(8192));
    }

    #[tokio::test]
    async fn parses_tool_calls_and_sends_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(header("x-call-id", "call-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_a",
                            "type": "function",
                            "function": {"name": "query_database", "arguments": "{\"query\":\"SELECT 1\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("test-key")
            .with_base_url(server.uri())
            .with_call_id("call-42")
            .with_options(CompletionOptions {
                temperature: Some(0.0),
                max_tokens: Some(512),
            });

        let response = client
            .chat_completion("test-model", &[ChatMessage::user("hi")], Some(&[][..]))
            .await
            .expect("completion");

        assert_eq!(response.content, None);
        let calls = response.tool_calls.expect("tool calls");
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.name, "query_database");
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(15));

        let requests = server.received_requests().await.expect("recorded");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 512);
        assert!(body.get("tools").is_none(), "empty tool list is omitted");
    }

    #[tokio::test]
    async fn non_success_status_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.uri());
        let err = client
            .chat_completion("m", &[ChatMessage::user("hi")], None)
            .await
            .unwrap_err();
        match err {
            LlmError::Api { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.uri());
        let err = client
            .chat_completion("m", &[ChatMessage::user("hi")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }
}
