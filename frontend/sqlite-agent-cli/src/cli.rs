use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "sqlite-agent",
    about = "Chat with an agent that manages members, products and purchases in SQLite"
)]
pub struct Cli {
    /// TOML config file; defaults apply when omitted.
    #[arg(long, env = "SQLITE_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Interactive chat (the default).
    Chat,
    /// List the tools a new session starts with.
    Tools,
    /// Print the contents of one table.
    Data {
        #[arg(value_enum)]
        table: TableName,
    },
    /// Load a tool script without starting a chat and report the result.
    CheckTool { file: PathBuf },
    /// Print the skeleton for a new tool script.
    Template {
        /// Print the complete InsertProduct example instead.
        #[arg(long)]
        example: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TableName {
    Members,
    Products,
    Records,
}

impl TableName {
    pub fn parse(value: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(value.trim(), true).ok()
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
