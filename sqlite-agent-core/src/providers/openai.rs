use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::providers::http::{send_with_retry, RetryPolicy};
use crate::providers::types::{
    parse_json_content, parse_tool_arguments, ChatMessage, GenerateOptions, ModelProvider,
    ModelResponse, StructuredSchema, ToolCall, ToolDeclaration,
};

/// Chat-completions client for OpenAI and API-compatible servers.
#[derive(Clone)]
pub struct OpenAiProvider {
    name: String,
    model: String,
    endpoint: String,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(
        name: String,
        model: String,
        base_url: &str,
        client: reqwest::Client,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            name,
            model,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            client,
            retry_policy,
        }
    }

    fn message_to_wire(message: &ChatMessage) -> Value {
        let mut wire = json!({
            "role": message.role,
            "content": message.content,
        });

        if let Some(tool_calls) = &message.tool_calls {
            wire["tool_calls"] = Value::Array(
                tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(tool_call_id) = &message.tool_call_id {
            wire["tool_call_id"] = json!(tool_call_id);
        }
        if let Some(name) = &message.name {
            wire["name"] = json!(name);
        }

        wire
    }

    fn base_payload(&self, messages: &[ChatMessage], options: &GenerateOptions) -> Value {
        json!({
            "model": self.model,
            "messages": messages.iter().map(Self::message_to_wire).collect::<Vec<_>>(),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        })
    }

    async fn send(&self, payload: Value, operation: &str) -> Result<OpenAiMessage> {
        let response = send_with_retry(
            self.client.post(&self.endpoint).json(&payload),
            &self.retry_policy,
            operation,
        )
        .await?;

        let payload: OpenAiResponse = response
            .json()
            .await
            .map_err(|err| Error::Provider(format!("failed to parse OpenAI response: {err}")))?;

        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| Error::Provider("OpenAI returned no choices".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDeclaration],
        options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        let mut payload = self.base_payload(messages, options);
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            payload["tool_choice"] = json!("auto");
        }

        let message = self.send(payload, "OpenAI chat request").await?;
        Ok(ModelResponse {
            content: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: parse_tool_arguments(&call.function.arguments),
                })
                .collect(),
        })
    }

    async fn generate_structured(
        &self,
        messages: &[ChatMessage],
        schema: &StructuredSchema,
        options: &GenerateOptions,
    ) -> Result<Value> {
        let mut payload = self.base_payload(messages, options);
        payload["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "description": schema.description,
                "schema": schema.schema,
                "strict": false,
            }
        });

        let message = self.send(payload, "OpenAI structured request").await?;
        let content = message.content.unwrap_or_default();
        parse_json_content(&content).ok_or_else(|| {
            Error::Provider(format!(
                "OpenAI structured output for '{}' is not JSON",
                schema.name
            ))
        })
    }
}
