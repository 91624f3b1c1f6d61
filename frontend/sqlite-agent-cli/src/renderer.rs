use std::io::Write;

use serde::Serialize;
use serde_json::{json, Value};
use sqlite_agent_core::tools::Table;
use sqlite_agent_core::{AgentStep, Error, ToolRegistry, ToolSpec};

use crate::cli::OutputFormat;

const JSON_SCHEMA: &str = "sqlite-agent-cli/output/v1";

#[derive(Serialize)]
struct JsonEnvelope<'a> {
    schema: &'static str,
    status: &'static str,
    command: &'a str,
    data: Value,
}

#[derive(Serialize)]
struct JsonErrorEnvelope<'a> {
    schema: &'static str,
    status: &'static str,
    command: &'a str,
    error: JsonErrorPayload,
}

#[derive(Serialize)]
struct JsonErrorPayload {
    code: &'static str,
    message: String,
}

fn error_code(error: &Error) -> &'static str {
    match error {
        Error::Config(_) => "config_error",
        Error::Validation(_) => "validation_error",
        Error::NotFound(_) => "not_found",
        Error::Provider(_) => "provider_error",
        Error::Storage(_) => "storage_error",
        Error::MalformedTool(_) => "malformed_tool",
        Error::UnresolvedSymbol { .. } => "unresolved_symbol",
        Error::ToolExecution(_) => "tool_execution_error",
        Error::ToolIndexOutOfRange { .. } => "tool_index_out_of_range",
        Error::Timeout(_) => "timeout",
        Error::Io(_) => "io_error",
        Error::Json(_) => "json_error",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    output_format: OutputFormat,
}

impl Renderer {
    pub fn new(output_format: OutputFormat) -> Self {
        Self { output_format }
    }

    fn print_json(&self, command: &str, data: Value) {
        let envelope = JsonEnvelope {
            schema: JSON_SCHEMA,
            status: "ok",
            command,
            data,
        };
        println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
    }

    pub fn render_step(&self, step: &AgentStep) {
        match self.output_format {
            OutputFormat::Text => self.render_step_text(step),
            OutputFormat::Json => self.print_json("chat.step", step.to_json()),
        }
    }

    fn render_step_text(&self, step: &AgentStep) {
        match step {
            AgentStep::Model { content, tool_call } => {
                if !content.trim().is_empty() {
                    println!("assistant> {content}");
                }
                if let Some(call) = tool_call {
                    println!(
                        "[tool] {} {}",
                        call.name,
                        serde_json::to_string(&call.arguments)
                            .unwrap_or_else(|_| "<invalid args>".to_owned())
                    );
                }
            }
            AgentStep::ToolResult { tool, output, .. } => {
                println!("[tool:{tool}]");
                println!("{output}");
            }
            AgentStep::Error(message) => {
                eprintln!("[error] {message}");
            }
        }
        std::io::stdout().flush().ok();
    }

    pub fn render_tools(&self, registry: &ToolRegistry) {
        match self.output_format {
            OutputFormat::Text => {
                if registry.is_empty() {
                    println!("No tools registered.");
                    return;
                }
                for (index, tool) in registry.iter().enumerate() {
                    let shadowed = registry
                        .get(&tool.name)
                        .is_some_and(|resolved| !std::ptr::eq(resolved, tool));
                    let marker = if shadowed { " (shadowed)" } else { "" };
                    println!("[{index}] {}{marker}", tool.name);
                    println!("    {}", tool.description);
                }
            }
            OutputFormat::Json => {
                let tools: Vec<Value> = registry
                    .iter()
                    .enumerate()
                    .map(|(index, tool)| {
                        json!({
                            "index": index,
                            "name": tool.name,
                            "description": tool.description,
                            "return_direct": tool.return_direct,
                            "parameters": tool.schema.to_json_schema(),
                        })
                    })
                    .collect();
                self.print_json(
                    "tools",
                    json!({ "version": registry.version(), "tools": tools }),
                );
            }
        }
    }

    pub fn render_table(&self, name: &str, table: &Table) {
        match self.output_format {
            OutputFormat::Text => {
                println!("{name}:");
                println!("{}", table.render());
            }
            OutputFormat::Json => self.print_json(
                "data",
                json!({ "table": name, "columns": table.columns, "rows": table.rows }),
            ),
        }
    }

    pub fn render_loaded(&self, tool: &ToolSpec) {
        match self.output_format {
            OutputFormat::Text => {
                println!("Loaded tool '{}': {}", tool.name, tool.description);
                for field in &tool.schema.fields {
                    let required = if field.required { "" } else { "?" };
                    println!("    {}: {}{required}", field.name, field.kind.as_str());
                }
            }
            OutputFormat::Json => self.print_json("tool.load", json!(tool.declaration())),
        }
    }

    pub fn render_notice(&self, command: &str, message: &str) {
        match self.output_format {
            OutputFormat::Text => println!("{message}"),
            OutputFormat::Json => self.print_json(command, json!({ "message": message })),
        }
    }

    pub fn render_source(&self, source: &str) {
        match self.output_format {
            OutputFormat::Text => print!("{source}"),
            OutputFormat::Json => self.print_json("template", json!({ "source": source })),
        }
    }

    pub fn render_error(&self, command: &str, error: &Error) {
        match self.output_format {
            OutputFormat::Text => eprintln!("[error] {error}"),
            OutputFormat::Json => {
                let envelope = JsonErrorEnvelope {
                    schema: JSON_SCHEMA,
                    status: "error",
                    command,
                    error: JsonErrorPayload {
                        code: error_code(error),
                        message: error.to_string(),
                    },
                };
                println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
            }
        }
    }
}
