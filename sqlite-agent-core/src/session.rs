use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agents::{Agent, AgentBuilder, AgentStep, SYSTEM_DIRECTIVE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction::Extractor;
use crate::providers::{create_provider, ModelProvider};
use crate::script::ToolLoader;
use crate::storage::model::{Member, Product, RecordView};
use crate::storage::{DataStore, SqliteStore};
use crate::tools::{default_tools, ToolRegistry, ToolSpec};

const STEP_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub at: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// Current contents of the three tables, for drivers that show them
/// beside the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tables {
    pub members: Vec<Member>,
    pub products: Vec<Product>,
    pub records: Vec<RecordView>,
}

/// Everything one conversation needs: the provider, the store, the tool
/// registry and the agent built from it. The agent is rebuilt lazily
/// whenever the registry has moved past the version it was built from.
pub struct AgentSession {
    id: Uuid,
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn DataStore>,
    registry: ToolRegistry,
    loader: ToolLoader,
    builder: AgentBuilder,
    agent: Option<Agent>,
    transcript: Arc<Mutex<Vec<TranscriptEntry>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(transcript: &Mutex<Vec<TranscriptEntry>>, role: &str, content: String) {
    lock(transcript).push(TranscriptEntry {
        at: Utc::now(),
        role: role.to_owned(),
        content,
    });
}

impl AgentSession {
    pub fn open(config: &Config) -> Result<Self> {
        let provider = create_provider(&config.provider)?;
        let store: Arc<dyn DataStore> = Arc::new(SqliteStore::new(&config.storage)?);
        Ok(Self::with_parts(provider, store, config))
    }

    pub fn with_parts(
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn DataStore>,
        config: &Config,
    ) -> Self {
        let extractor = Extractor::new(provider.clone(), config.agent.extraction_temperature);
        let registry = ToolRegistry::new(default_tools(store.clone(), extractor.clone()));
        let loader = ToolLoader::new(store.clone(), extractor, config.loader.clone());
        let id = Uuid::new_v4();
        tracing::info!(session = %id, provider = provider.name(), model = provider.model(), "opened session");

        Self {
            id,
            provider,
            store,
            registry,
            loader,
            builder: AgentBuilder::new(&config.agent),
            agent: None,
            transcript: Arc::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn loader(&self) -> &ToolLoader {
        &self.loader
    }

    /// The agent for the current registry, rebuilt only if a tool change
    /// happened since it was last built.
    pub fn agent(&mut self) -> &Agent {
        let current = self.registry.version();
        if let Some(agent) = self.agent.take().filter(|agent| agent.version() == current) {
            return self.agent.insert(agent);
        }
        self.rebuild_agent()
    }

    pub fn rebuild_agent(&mut self) -> &Agent {
        let agent = self.builder.build(
            self.provider.clone(),
            &self.registry.snapshot(),
            SYSTEM_DIRECTIVE,
        );
        tracing::debug!(session = %self.id, version = agent.version(), "rebuilt agent");
        self.agent.insert(agent)
    }

    /// Loads a tool from script source, registers it and rebuilds the
    /// agent. On failure the registry is left exactly as it was.
    pub async fn add_tool_from_source(&mut self, source: &str) -> Result<&ToolSpec> {
        let tool = match self.loader.load(source).await {
            Ok(tool) => tool,
            Err(err) => {
                tracing::warn!(session = %self.id, %err, "tool source rejected");
                return Err(err);
            }
        };
        let name = tool.name.clone();
        self.registry.register(tool);
        self.rebuild_agent();
        self.registry
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))
    }

    pub fn update_description(&mut self, name: &str, description: &str) -> Result<()> {
        if self.registry.update_description(name, description) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("tool '{name}'")))
        }
    }

    pub fn remove_tool_at(&mut self, index: usize) -> Result<ToolSpec> {
        self.registry.remove_at(index)
    }

    pub fn remove_tool(&mut self, name: &str) -> Result<ToolSpec> {
        self.registry.remove(name)
    }

    /// Starts a turn and streams its steps. Both the message and the steps
    /// are appended to the transcript as they pass through.
    pub fn send(&mut self, message: &str) -> mpsc::Receiver<AgentStep> {
        record(&self.transcript, "user", message.to_owned());
        let mut steps = self.agent().stream(message);

        let (tx, rx) = mpsc::channel(STEP_BUFFER);
        let transcript = self.transcript.clone();
        tokio::spawn(async move {
            while let Some(step) = steps.recv().await {
                record(&transcript, step.role(), step.render());
                if tx.send(step).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub async fn chat(&mut self, message: &str) -> Vec<AgentStep> {
        let mut rx = self.send(message);
        let mut steps = Vec::new();
        while let Some(step) = rx.recv().await {
            steps.push(step);
        }
        steps
    }

    pub async fn tables(&self) -> Result<Tables> {
        let (members, products, records) = tokio::try_join!(
            self.store.list_all_members(),
            self.store.list_all_products(),
            self.store.list_all_records(),
        )?;
        Ok(Tables {
            members,
            products,
            records,
        })
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        lock(&self.transcript).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::ScriptedProvider;
    use crate::script::INSERT_PRODUCT_EXAMPLE;
    use crate::tools::output::ToolOutput;
    use serde_json::json;

    fn session(provider: &ScriptedProvider) -> AgentSession {
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        AgentSession::with_parts(Arc::new(provider.clone()), store, &Config::default())
    }

    #[tokio::test]
    async fn loaded_tool_is_registered_and_callable() {
        let provider = ScriptedProvider::default();
        let mut session = session(&provider);
        let before = session.registry().version();

        let tool = session
            .add_tool_from_source(INSERT_PRODUCT_EXAMPLE)
            .await
            .expect("load");
        assert_eq!(tool.name, "InsertProduct");
        assert_eq!(session.registry().len(), 6);
        assert!(session.registry().version() > before);

        let agent = session.agent();
        assert_eq!(agent.declarations().len(), 6);
        assert_eq!(agent.declarations()[5].name, "InsertProduct");

        provider.push_response(ScriptedProvider::tool_call(
            "InsertProduct",
            json!({"text": "Please add a Tablet for 299.5"}),
        ));
        provider.push_structured(
            "ProductInfo",
            json!({"name": "Tablet", "price": 299.5, "quantity": null}),
        );
        let steps = session.chat("Please add a Tablet for 299.5").await;
        assert_eq!(
            steps.last().map(AgentStep::render).as_deref(),
            Some("Inserted product Tablet (ID: 4, price: 299.5)")
        );
        assert_eq!(session.tables().await.expect("tables").products.len(), 4);
    }

    #[tokio::test]
    async fn rejected_source_leaves_registry_untouched() {
        let provider = ScriptedProvider::default();
        let mut session = session(&provider);
        let version = session.registry().version();
        let names = session.registry().descriptions();

        let err = session
            .add_tool_from_source("fn f(text) { return text }")
            .await
            .expect_err("no definition");
        assert!(matches!(err, Error::MalformedTool(_)));
        assert_eq!(session.registry().version(), version);
        assert_eq!(session.registry().descriptions(), names);
    }

    #[tokio::test]
    async fn description_edits_survive_tool_loads() {
        let provider = ScriptedProvider::default();
        let mut session = session(&provider);
        session
            .update_description("ViewAllMembers", "Lists the members")
            .expect("update");
        assert!(matches!(
            session.update_description("Nope", "x"),
            Err(Error::NotFound(_))
        ));

        session
            .add_tool_from_source(INSERT_PRODUCT_EXAMPLE)
            .await
            .expect("load");
        let members = session
            .agent()
            .declarations()
            .iter()
            .find(|declaration| declaration.name == "ViewAllMembers")
            .map(|declaration| declaration.description.clone());
        assert_eq!(members.as_deref(), Some("Lists the members"));
    }

    #[tokio::test]
    async fn agent_is_rebuilt_only_after_changes() {
        let provider = ScriptedProvider::default();
        let mut session = session(&provider);
        let first = session.agent().version();
        assert_eq!(session.agent().version(), first);

        session.remove_tool("ViewAllProducts").expect("remove");
        let rebuilt = session.agent();
        assert_ne!(rebuilt.version(), first);
        assert!(rebuilt.tool("ViewAllProducts").is_none());

        let err = session.remove_tool_at(10).expect_err("out of range");
        assert!(matches!(err, Error::ToolIndexOutOfRange { index: 10, len: 4 }));
        let removed = session.remove_tool_at(0).expect("remove first");
        assert_eq!(removed.name, "ExtractAndWriteUserInfo");
        assert_eq!(session.registry().len(), 3);
    }

    #[tokio::test]
    async fn chat_is_recorded_in_the_transcript() {
        let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call(
            "ViewAllProducts",
            json!({}),
        )]);
        let mut session = session(&provider);
        let steps = session.chat("What products do you have?").await;
        assert!(matches!(
            &steps[1],
            AgentStep::ToolResult { output: ToolOutput::Table(_), .. }
        ));

        let transcript = session.transcript();
        let roles: Vec<&str> = transcript.iter().map(|entry| entry.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool"]);
        assert_eq!(transcript[0].content, "What products do you have?");
        assert!(transcript[2].content.contains("Smartphone"));
    }

    #[tokio::test]
    async fn tables_reflect_seed_data() {
        let provider = ScriptedProvider::default();
        let session = session(&provider);
        let tables = session.tables().await.expect("tables");
        assert_eq!(tables.members.len(), 3);
        assert_eq!(tables.products.len(), 3);
        assert_eq!(tables.records.len(), 3);
    }
}
