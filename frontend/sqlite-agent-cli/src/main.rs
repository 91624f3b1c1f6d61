mod cli;
mod renderer;
mod repl;

use sqlite_agent_core::config::{self, Config};
use sqlite_agent_core::script::{INSERT_PRODUCT_EXAMPLE, TOOL_TEMPLATE};
use sqlite_agent_core::tools::Table;
use sqlite_agent_core::{logging, AgentSession, DataStore, Error, Result, SqliteStore};

use crate::cli::{Command, TableName};
use crate::renderer::Renderer;

fn main() {
    if let Err(error) = run() {
        eprintln!("sqlite-agent failed: {error}");
        std::process::exit(1);
    }
}

pub(crate) async fn load_table(
    store: &dyn DataStore,
    table: TableName,
) -> Result<(&'static str, Table)> {
    Ok(match table {
        TableName::Members => ("members", Table::from_records(&store.list_all_members().await?)?),
        TableName::Products => ("products", Table::from_records(&store.list_all_products().await?)?),
        TableName::Records => ("records", Table::from_records(&store.list_all_records().await?)?),
    })
}

fn run() -> Result<()> {
    let args = cli::Cli::parse_args();
    let config = config::load(args.config.as_deref())?;
    config::validate_config(&config)?;
    logging::init_tracing(&config.logging.level);

    let renderer = Renderer::new(args.format);
    let command = args.command.unwrap_or(Command::Chat);
    if let Command::Template { example } = command {
        renderer.render_source(if example {
            INSERT_PRODUCT_EXAMPLE
        } else {
            TOOL_TEMPLATE
        });
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|err| Error::Config(format!("failed to create tokio runtime: {err}")))?;
    runtime.block_on(execute(command, &config, renderer))
}

async fn execute(command: Command, config: &Config, renderer: Renderer) -> Result<()> {
    match command {
        Command::Data { table } => {
            let store = SqliteStore::new(&config.storage)?;
            let (label, rendered) = load_table(&store, table).await?;
            renderer.render_table(label, &rendered);
        }
        Command::Tools => {
            let session = AgentSession::open(config)?;
            renderer.render_tools(session.registry());
        }
        Command::CheckTool { file } => {
            let source = std::fs::read_to_string(&file).map_err(|err| {
                Error::Config(format!("failed to read '{}': {err}", file.display()))
            })?;
            let mut session = AgentSession::open(config)?;
            match session.add_tool_from_source(&source).await {
                Ok(tool) => renderer.render_loaded(tool),
                Err(error) => {
                    renderer.render_error("check-tool", &error);
                    std::process::exit(1);
                }
            }
        }
        Command::Chat | Command::Template { .. } => {
            let session = AgentSession::open(config)?;
            repl::Repl::new(session, renderer).run().await?;
        }
    }
    Ok(())
}
