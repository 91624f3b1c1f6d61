//! The tool-script language: a small interpreted language in which new
//! tools are written at runtime, and the loader that turns source text
//! into a registered [`ToolSpec`](crate::tools::ToolSpec).

pub mod ast;
pub mod builtins;
pub mod interpreter;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod scan;
pub mod value;

pub use interpreter::{ExtractKind, Limits, Machine, Namespace, ScriptHost};
pub use loader::ToolLoader;
pub use scan::{scan_tool_definition, ToolDefinition};

use crate::error::Error;

/// Skeleton shown to users who start writing a tool.
pub const TOOL_TEMPLATE: &str = include_str!("templates/tool_template.tool");

/// A complete tool that inserts a product named in free text.
pub const INSERT_PRODUCT_EXAMPLE: &str = include_str!("templates/insert_product.tool");

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("syntax error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("runtime error at line {line}: {message}")]
    Runtime { line: usize, message: String },

    #[error("budget exceeded: {0}")]
    Budget(String),
}

impl ScriptError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn runtime(line: usize, message: impl Into<String>) -> Self {
        Self::Runtime {
            line,
            message: message.into(),
        }
    }
}

impl From<ScriptError> for Error {
    fn from(err: ScriptError) -> Self {
        Error::ToolExecution(err.to_string())
    }
}
