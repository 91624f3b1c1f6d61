use std::io::{self, Write};
use std::path::Path;

use sqlite_agent_core::script::{INSERT_PRODUCT_EXAMPLE, TOOL_TEMPLATE};
use sqlite_agent_core::tools::Table;
use sqlite_agent_core::{AgentSession, AgentStep, Error, Result};

use crate::cli::TableName;
use crate::renderer::Renderer;

const HELP: &str = "\
Commands:
  /tools                      list registered tools with their index
  /describe <name> <text>     replace a tool's description (quote names with spaces)
  /remove <index>             remove the tool at an index
  /remove-tool <name>         remove a tool by name
  /load <file>                load a tool script and register it
  /data <members|products|records>
  /template [example]         print the tool skeleton or the InsertProduct example
  /help                       show this help
  exit                        leave the chat
Anything else is sent to the agent.";

pub struct Repl {
    session: AgentSession,
    renderer: Renderer,
}

/// Splits a leading tool name off `input`; a name with spaces is quoted.
fn split_name(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    if let Some(rest) = input.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some((rest[..end].to_owned(), rest[end + 1..].trim()));
    }
    let (name, rest) = input.split_once(char::is_whitespace).unwrap_or((input, ""));
    (!name.is_empty()).then(|| (name.to_owned(), rest.trim()))
}

/// Any tool other than the read-only views may have written to the store.
fn may_have_written(step: &AgentStep) -> bool {
    matches!(step, AgentStep::ToolResult { tool, .. } if !tool.starts_with("View"))
}

impl Repl {
    pub fn new(session: AgentSession, renderer: Renderer) -> Self {
        Self { session, renderer }
    }

    pub async fn run(&mut self) -> Result<()> {
        println!("SQLite agent chat (session {})", self.session.id());
        println!("Type /help for commands, 'exit' to quit.");
        println!();

        loop {
            print!("> ");
            io::stdout().flush()?;

            let mut input = String::new();
            if io::stdin().read_line(&mut input)? == 0 {
                break;
            }
            let input = input.trim();
            if input.is_empty() {
                continue;
            }
            if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                println!("Goodbye!");
                break;
            }

            match input.strip_prefix('/') {
                Some(command) => {
                    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
                    if let Err(error) = self.command(name, rest.trim()).await {
                        self.renderer.render_error(name, &error);
                    }
                }
                None => self.chat(input).await,
            }
        }
        Ok(())
    }

    async fn chat(&mut self, message: &str) {
        let mut steps = self.session.send(message);
        let mut wrote = false;
        while let Some(step) = steps.recv().await {
            wrote |= may_have_written(&step);
            self.renderer.render_step(&step);
        }

        if wrote {
            if let Err(error) = self.refresh_data().await {
                self.renderer.render_error("refresh", &error);
            }
        }
    }

    async fn refresh_data(&self) -> Result<()> {
        let tables = self.session.tables().await?;
        self.renderer
            .render_notice("refresh", "Database updated! Data refreshed.");
        self.renderer
            .render_table("members", &Table::from_records(&tables.members)?);
        self.renderer
            .render_table("products", &Table::from_records(&tables.products)?);
        self.renderer
            .render_table("records", &Table::from_records(&tables.records)?);
        Ok(())
    }

    async fn command(&mut self, name: &str, rest: &str) -> Result<()> {
        match name {
            "help" => println!("{HELP}"),
            "tools" => self.renderer.render_tools(self.session.registry()),
            "describe" => {
                let Some((tool, description)) = split_name(rest).filter(|(_, text)| !text.is_empty())
                else {
                    return Err(Error::Validation("usage: /describe <name> <text>".to_owned()));
                };
                self.session.update_description(&tool, description)?;
                self.renderer
                    .render_notice("describe", &format!("Updated description of '{tool}'."));
            }
            "remove" => {
                let index = rest.parse::<usize>().map_err(|_| {
                    Error::Validation(format!("'{rest}' is not a tool index"))
                })?;
                let removed = self.session.remove_tool_at(index)?;
                self.renderer
                    .render_notice("remove", &format!("Removed tool '{}'.", removed.name));
            }
            "remove-tool" => {
                let Some((tool, _)) = split_name(rest) else {
                    return Err(Error::Validation("usage: /remove-tool <name>".to_owned()));
                };
                let removed = self.session.remove_tool(&tool)?;
                self.renderer
                    .render_notice("remove-tool", &format!("Removed tool '{}'.", removed.name));
            }
            "load" => {
                if rest.is_empty() {
                    return Err(Error::Validation("usage: /load <file>".to_owned()));
                }
                let source = std::fs::read_to_string(Path::new(rest))?;
                let tool = self.session.add_tool_from_source(&source).await?;
                self.renderer.render_loaded(tool);
            }
            "data" => {
                let table = TableName::parse(rest).ok_or_else(|| {
                    Error::Validation("usage: /data <members|products|records>".to_owned())
                })?;
                let store = self.session.store();
                let (label, rendered) = crate::load_table(store.as_ref(), table).await?;
                self.renderer.render_table(label, &rendered);
            }
            "template" => {
                let source = if rest == "example" {
                    INSERT_PRODUCT_EXAMPLE
                } else {
                    TOOL_TEMPLATE
                };
                self.renderer.render_source(source);
            }
            other => {
                return Err(Error::NotFound(format!(
                    "command '/{other}'; type /help for the list"
                )))
            }
        }
        Ok(())
    }
}
