pub mod agents;
pub mod config;
pub mod error;
pub mod extraction;
pub mod logging;
pub mod providers;
pub mod script;
pub mod session;
pub mod storage;
pub mod tools;

pub use agents::{Agent, AgentBuilder, AgentStep};
pub use config::Config;
pub use error::{Error, Result};
pub use script::ToolLoader;
pub use session::{AgentSession, Tables, TranscriptEntry};
pub use storage::{DataStore, SqliteStore};
pub use tools::{ToolOutput, ToolRegistry, ToolSpec};
