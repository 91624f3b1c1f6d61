use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::providers::http::{send_with_retry, RetryPolicy};
use crate::providers::types::{
    parse_json_content, parse_tool_arguments, ChatMessage, GenerateOptions, ModelProvider,
    ModelResponse, StructuredSchema, ToolCall, ToolDeclaration,
};

#[derive(Clone)]
pub struct OllamaProvider {
    name: String,
    model: String,
    chat_endpoint: String,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("chat_endpoint", &self.chat_endpoint)
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl OllamaProvider {
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
            chat_endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
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
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments,
                            }
                        })
                    })
                    .collect(),
            );
        }
        wire
    }

    fn payload(&self, messages: &[ChatMessage], options: &GenerateOptions) -> Value {
        json!({
            "model": self.model,
            "messages": messages.iter().map(Self::message_to_wire).collect::<Vec<_>>(),
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            }
        })
    }

    async fn send(&self, payload: Value, operation: &str) -> Result<OllamaMessage> {
        let response = send_with_retry(
            self.client.post(&self.chat_endpoint).json(&payload),
            &self.retry_policy,
            operation,
        )
        .await?;

        let payload: OllamaChatResponse = response
            .json()
            .await
            .map_err(|err| Error::Provider(format!("failed to parse Ollama response: {err}")))?;

        Ok(payload.message)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[async_trait]
impl ModelProvider for OllamaProvider {
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
        let mut payload = self.payload(messages, options);
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
        }

        let message = self.send(payload, "Ollama chat request").await?;
        Ok(ModelResponse {
            content: message.content,
            // Ollama does not number its calls.
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
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
        let mut payload = self.payload(messages, options);
        payload["format"] = schema.schema.clone();

        let message = self.send(payload, "Ollama structured request").await?;
        parse_json_content(&message.content).ok_or_else(|| {
            Error::Provider(format!(
                "Ollama structured output for '{}' is not JSON",
                schema.name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_arguments_stay_objects_on_the_wire() {
        let call = ToolCall {
            id: "call_1".to_owned(),
            name: "Purchase".to_owned(),
            arguments: json!({"text": "two laptops"}),
        };
        let wire = OllamaProvider::message_to_wire(&ChatMessage::assistant("", vec![call]));
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            json!({"text": "two laptops"})
        );
    }

    #[test]
    fn decodes_chat_response_with_tool_calls() {
        let raw = json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "ViewAllMembers", "arguments": {}}}]
            },
            "done": true
        });
        let response: OllamaChatResponse = serde_json::from_value(raw).expect("response decodes");
        assert_eq!(response.message.tool_calls.len(), 1);
        assert_eq!(response.message.tool_calls[0].function.name, "ViewAllMembers");
    }
}
