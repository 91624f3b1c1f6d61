use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agents::step::AgentStep;
use crate::config::schema::AgentConfig;
use crate::providers::types::parse_tool_arguments;
use crate::providers::{ChatMessage, GenerateOptions, ModelProvider, ModelResponse, ToolCall, ToolDeclaration};
use crate::tools::output::ToolOutput;
use crate::tools::registry::RegistrySnapshot;
use crate::tools::types::ToolSpec;

const STEP_BUFFER: usize = 32;

/// Builds agents from registry snapshots. Building never touches the
/// registry; the same snapshot always yields the same tool set.
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    options: GenerateOptions,
    max_tool_rounds: usize,
}

impl AgentBuilder {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            options: GenerateOptions {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            max_tool_rounds: config.max_tool_rounds.max(1),
        }
    }

    pub fn build(
        &self,
        provider: Arc<dyn ModelProvider>,
        snapshot: &RegistrySnapshot,
        directive: &str,
    ) -> Agent {
        let tools = resolve_shadowing(&snapshot.tools);
        let declarations = tools.iter().map(ToolSpec::declaration).collect();
        tracing::debug!(
            version = snapshot.version,
            tools = tools.len(),
            provider = provider.name(),
            "built agent"
        );

        Agent {
            provider,
            tools: tools.into(),
            declarations,
            directive: directive.into(),
            options: self.options.clone(),
            max_tool_rounds: self.max_tool_rounds,
            version: snapshot.version,
        }
    }
}

/// Keeps the last entry for every name, at that entry's position.
fn resolve_shadowing(tools: &[ToolSpec]) -> Vec<ToolSpec> {
    let mut seen = HashSet::new();
    let mut kept: Vec<ToolSpec> = tools
        .iter()
        .rev()
        .filter(|tool| seen.insert(tool.name.as_str()))
        .cloned()
        .collect();
    kept.reverse();
    kept
}

/// An agent bound to one registry version. Cheap to clone.
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<[ToolSpec]>,
    declarations: Arc<[ToolDeclaration]>,
    directive: Arc<str>,
    options: GenerateOptions,
    max_tool_rounds: usize,
    version: u64,
}

#[derive(Debug, Deserialize)]
struct ParsedToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
}

impl Agent {
    /// Registry version the agent was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    pub fn directive(&self) -> &str {
        &self.directive
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Runs one turn in a background task and streams its steps.
    pub fn stream(&self, message: impl Into<String>) -> mpsc::Receiver<AgentStep> {
        let (tx, rx) = mpsc::channel(STEP_BUFFER);
        let agent = self.clone();
        let message = message.into();
        tokio::spawn(async move {
            agent.drive(message, tx).await;
        });
        rx
    }

    pub async fn run(&self, message: impl Into<String>) -> Vec<AgentStep> {
        let mut rx = self.stream(message);
        let mut steps = Vec::new();
        while let Some(step) = rx.recv().await {
            steps.push(step);
        }
        steps
    }

    async fn drive(&self, message: String, tx: mpsc::Sender<AgentStep>) {
        let mut context = vec![
            ChatMessage::system(self.directive.as_ref()),
            ChatMessage::user(message),
        ];

        for round in 0..self.max_tool_rounds {
            let response = match self
                .provider
                .complete(&context, &self.declarations, &self.options)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(%err, round, "model call failed");
                    let _ = tx.send(AgentStep::Error(err.to_string())).await;
                    return;
                }
            };

            let call = first_tool_call(&response);
            let model_step = AgentStep::Model {
                content: response.content.clone(),
                tool_call: call.clone(),
            };
            if tx.send(model_step).await.is_err() {
                return;
            }
            let Some(call) = call else {
                return;
            };

            let (output, return_direct) = self.execute(&call).await;
            let tool_message = ChatMessage::tool(&call, output.render());
            let result_step = AgentStep::ToolResult {
                tool: call.name.clone(),
                output,
                return_direct,
            };
            if tx.send(result_step).await.is_err() || return_direct {
                return;
            }

            context.push(ChatMessage::assistant(response.content, vec![call]));
            context.push(tool_message);
        }

        tracing::debug!(
            max_tool_rounds = self.max_tool_rounds,
            "agent reached max tool rounds; ending turn"
        );
    }

    /// Unknown tools and failing tools come back as text the model (or
    /// the user, for return-direct tools) can read.
    async fn execute(&self, call: &ToolCall) -> (ToolOutput, bool) {
        let Some(tool) = self.tool(&call.name) else {
            tracing::warn!(tool = %call.name, "model requested an unknown tool");
            let available: Vec<&str> = self.tools.iter().map(|tool| tool.name.as_str()).collect();
            return (
                ToolOutput::text(format!(
                    "Error: tool '{}' is not available. Available tools: {}",
                    call.name,
                    available.join(", ")
                )),
                false,
            );
        };

        match tool.invoke(call.arguments.clone()).await {
            Ok(output) => (output, tool.return_direct),
            Err(err) => {
                tracing::warn!(tool = %call.name, %err, "tool call failed");
                (ToolOutput::text(format!("Error: {err}")), tool.return_direct)
            }
        }
    }
}

/// The call the agent acts on: the first native tool call, or a JSON
/// `{"tool": .., "args": ..}` reply from models without function calling.
fn first_tool_call(response: &ModelResponse) -> Option<ToolCall> {
    if let Some(first) = response.tool_calls.first() {
        if response.tool_calls.len() > 1 {
            tracing::debug!(
                requested = response.tool_calls.len(),
                tool = %first.name,
                "model requested several tool calls; acting on the first only"
            );
        }
        return Some(ToolCall {
            id: first.id.clone(),
            name: first.name.clone(),
            arguments: parse_tool_arguments(&first.arguments),
        });
    }

    let parsed: ParsedToolCall = serde_json::from_str(response.content.trim()).ok()?;
    Some(ToolCall {
        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        name: parsed.tool,
        arguments: parse_tool_arguments(&parsed.args),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::SYSTEM_DIRECTIVE;
    use crate::error::{Error, Result};
    use crate::extraction::Extractor;
    use crate::providers::mock::ScriptedProvider;
    use crate::providers::StructuredSchema;
    use crate::storage::SqliteStore;
    use crate::tools::registry::ToolRegistry;
    use crate::tools::types::{FieldKind, InputSchema, ToolHandler};
    use crate::tools::default_tools;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::text(format!(
                "echo: {}",
                args.get("text").and_then(Value::as_str).unwrap_or_default()
            )))
        }
    }

    fn echo_tool(description: &str, return_direct: bool) -> ToolSpec {
        ToolSpec::new(
            "Echo",
            description,
            InputSchema::new("EchoInput").field("text", FieldKind::String, "Text to echo"),
            Arc::new(Echo),
        )
        .return_direct(return_direct)
    }

    fn default_registry(provider: &ScriptedProvider) -> ToolRegistry {
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        let extractor = Extractor::new(Arc::new(provider.clone()), 0.0);
        ToolRegistry::new(default_tools(store, extractor))
    }

    fn build(provider: &ScriptedProvider, registry: &ToolRegistry) -> Agent {
        AgentBuilder::new(&AgentConfig::default()).build(
            Arc::new(provider.clone()),
            &registry.snapshot(),
            SYSTEM_DIRECTIVE,
        )
    }

    #[tokio::test]
    async fn return_direct_tool_ends_the_turn() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call(
            "ViewAllMembers",
            json!({}),
        )]);
        let registry = default_registry(&provider);
        let agent = build(&provider, &registry);

        let steps = agent.run("Show me all members").await;
        assert_eq!(steps.len(), 2, "{steps:?}");
        assert!(matches!(
            &steps[0],
            AgentStep::Model { tool_call: Some(call), .. } if call.name == "ViewAllMembers"
        ));
        let AgentStep::ToolResult {
            tool,
            output: ToolOutput::Table(table),
            return_direct: true,
        } = &steps[1]
        else {
            panic!("expected table result, got {:?}", steps[1]);
        };
        assert_eq!(tool, "ViewAllMembers");
        assert_eq!(table.rows.len(), 3);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn declarations_follow_the_snapshot() {
        let provider = ScriptedProvider::default();
        let mut registry = default_registry(&provider);
        assert!(registry.update_description("ViewAllProducts", "List every product"));
        let agent = build(&provider, &registry);

        assert_eq!(agent.version(), registry.version());
        assert_eq!(agent.declarations().len(), 5);
        let products = agent
            .declarations()
            .iter()
            .find(|declaration| declaration.name == "ViewAllProducts")
            .expect("declared");
        assert_eq!(products.description, "List every product");

        agent.run("hello").await;
        let requests = provider.requests();
        assert_eq!(requests[0].tools, agent.declarations());
        assert_eq!(requests[0].messages[0].content, SYSTEM_DIRECTIVE);
    }

    #[tokio::test]
    async fn shadowed_tools_are_declared_once() {
        let provider = ScriptedProvider::default();
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool("first", true));
        registry.register(echo_tool("second", true));
        let agent = build(&provider, &registry);

        assert_eq!(agent.declarations().len(), 1);
        assert_eq!(agent.declarations()[0].description, "second");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn tool_result_is_fed_back_when_not_return_direct() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_call("Echo", json!({"text": "hi"})),
            ScriptedProvider::text("The tool said hi."),
        ]);
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool("Echo text", false));
        let agent = build(&provider, &registry);

        let steps = agent.run("say hi").await;
        assert_eq!(steps.len(), 3, "{steps:?}");
        assert_eq!(steps[1].render(), "echo: hi");
        assert_eq!(steps[2].render(), "The tool said hi.");

        let second = &provider.requests()[1].messages;
        let tool_message = second.last().expect("tool message");
        assert_eq!(tool_message.role, "tool");
        assert_eq!(tool_message.content, "echo: hi");
    }

    #[tokio::test]
    async fn only_the_first_of_several_calls_runs() {
        let mut response = ScriptedProvider::tool_call("Echo", json!({"text": "one"}));
        response.tool_calls.push(ToolCall {
            id: "call_2".to_owned(),
            name: "Echo".to_owned(),
            arguments: json!({"text": "two"}),
        });
        let provider = ScriptedProvider::new(vec![response]);
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool("Echo text", true));
        let agent = build(&provider, &registry);

        let steps = agent.run("twice").await;
        let results: Vec<String> = steps
            .iter()
            .filter(|step| matches!(step, AgentStep::ToolResult { .. }))
            .map(AgentStep::render)
            .collect();
        assert_eq!(results, ["echo: one"]);
    }

    #[tokio::test]
    async fn json_reply_is_treated_as_a_tool_call() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text(
            r#"{"tool": "Echo", "args": "{\"text\": \"json\"}"}"#,
        )]);
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool("Echo text", true));
        let agent = build(&provider, &registry);

        let steps = agent.run("json please").await;
        assert_eq!(steps.last().map(AgentStep::render).as_deref(), Some("echo: json"));
    }

    #[tokio::test]
    async fn unknown_tools_and_failures_do_not_end_the_session() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call(
            "Missing",
            json!({}),
        )]);
        let mut registry = ToolRegistry::default();
        registry.register(echo_tool("Echo text", true));
        let agent = build(&provider, &registry);

        let steps = agent.run("use a missing tool").await;
        assert!(steps[1].render().contains("'Missing' is not available"));
        assert_eq!(steps.last().map(AgentStep::render).as_deref(), Some("MOCK: use a missing tool"));

        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call("Echo", json!({}))]);
        let agent = build(&provider, &registry);
        let steps = agent.run("no arguments").await;
        assert!(steps[1].render().starts_with("Error: validation error"), "{steps:?}");
    }

    struct Unreachable;

    #[async_trait]
    impl ModelProvider for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        fn model(&self) -> &str {
            "none"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDeclaration],
            _options: &GenerateOptions,
        ) -> Result<ModelResponse> {
            Err(Error::Provider("connection refused".to_owned()))
        }

        async fn generate_structured(
            &self,
            _messages: &[ChatMessage],
            _schema: &StructuredSchema,
            _options: &GenerateOptions,
        ) -> Result<Value> {
            Err(Error::Provider("connection refused".to_owned()))
        }
    }

    #[tokio::test]
    async fn provider_failure_becomes_an_error_step() {
        let agent = AgentBuilder::new(&AgentConfig::default()).build(
            Arc::new(Unreachable),
            &ToolRegistry::default().snapshot(),
            SYSTEM_DIRECTIVE,
        );
        let steps = agent.run("hello").await;
        assert_eq!(
            steps,
            [AgentStep::Error("provider error: connection refused".to_owned())]
        );
    }
}
