use serde_json::{json, Value};

use crate::providers::ToolCall;
use crate::tools::output::ToolOutput;

/// One observable step of a conversation turn, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    /// A model reply. `tool_call` is the call the agent acted on, if any.
    Model {
        content: String,
        tool_call: Option<ToolCall>,
    },
    ToolResult {
        tool: String,
        output: ToolOutput,
        return_direct: bool,
    },
    /// The provider failed; the turn ends here but the session goes on.
    Error(String),
}

impl AgentStep {
    pub fn role(&self) -> &'static str {
        match self {
            Self::Model { .. } => "assistant",
            Self::ToolResult { .. } => "tool",
            Self::Error(_) => "error",
        }
    }

    /// Human-readable text of the step; empty for a model turn that only
    /// requested a tool.
    pub fn render(&self) -> String {
        match self {
            Self::Model { content, .. } => content.clone(),
            Self::ToolResult { output, .. } => output.render(),
            Self::Error(message) => format!("Error: {message}"),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Model { content, tool_call } => json!({
                "role": self.role(),
                "content": content,
                "tool_call": tool_call,
            }),
            Self::ToolResult {
                tool,
                output,
                return_direct,
            } => json!({
                "role": self.role(),
                "tool": tool,
                "output": output.to_json(),
                "return_direct": return_direct,
            }),
            Self::Error(message) => json!({ "role": self.role(), "error": message }),
        }
    }
}
