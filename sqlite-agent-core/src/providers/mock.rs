use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::providers::types::{
    ChatMessage, GenerateOptions, ModelProvider, ModelResponse, StructuredSchema, ToolCall,
    ToolDeclaration,
};

/// What the provider saw on one `complete` call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDeclaration>,
}

/// Pre-scripted provider for tests and offline runs. Each `complete` call
/// pops the next scripted response; once the script is exhausted it echoes
/// the last user message. Structured calls pop from a per-schema queue and
/// fall back to an empty object.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    responses: Arc<Mutex<VecDeque<ModelResponse>>>,
    structured: Arc<Mutex<HashMap<String, VecDeque<Value>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    /// Model turn that requests a single tool call.
    pub fn tool_call(name: &str, arguments: Value) -> ModelResponse {
        ModelResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call_{name}"),
                name: name.to_owned(),
                arguments,
            }],
        }
    }

    pub fn text(content: &str) -> ModelResponse {
        ModelResponse {
            content: content.to_owned(),
            tool_calls: Vec::new(),
        }
    }

    pub fn push_response(&self, response: ModelResponse) {
        lock(&self.responses).push_back(response);
    }

    /// Queues the structured output returned for the schema called `schema_name`.
    pub fn push_structured(&self, schema_name: &str, value: Value) {
        lock(&self.structured)
            .entry(schema_name.to_owned())
            .or_default()
            .push_back(value);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDeclaration],
        _options: &GenerateOptions,
    ) -> Result<ModelResponse> {
        lock(&self.requests).push(RecordedRequest {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });

        if let Some(response) = lock(&self.responses).pop_front() {
            return Ok(response);
        }

        let reply = messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.as_str())
            .unwrap_or("[no input]");
        Ok(Self::text(&format!("MOCK: {reply}")))
    }

    async fn generate_structured(
        &self,
        _messages: &[ChatMessage],
        schema: &StructuredSchema,
        _options: &GenerateOptions,
    ) -> Result<Value> {
        let next = lock(&self.structured)
            .get_mut(&schema.name)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| json!({})))
    }
}
