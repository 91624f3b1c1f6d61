use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The tool source did not contain exactly one well-formed
    /// `structured_tool(...)` expression.
    #[error("malformed tool definition: {0}")]
    MalformedTool(String),

    #[error("unresolved {kind} '{symbol}' in tool source")]
    UnresolvedSymbol { kind: &'static str, symbol: String },

    /// Failure raised by user-supplied tool code, at load time or when the
    /// tool is invoked.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("tool index {index} is out of range for a registry of {len} tool(s)")]
    ToolIndexOutOfRange { index: usize, len: usize },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
