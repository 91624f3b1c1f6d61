use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tools::types::ToolSpec;

/// Ordered tool collection for one session. `version` moves forward on
/// every change that an agent built from an older snapshot would miss.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
    version: u64,
}

/// Immutable view handed to the agent builder.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub tools: Arc<[ToolSpec]>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools, version: 0 }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    /// Appends `spec`. An earlier tool with the same name stays listed but
    /// is shadowed: lookups resolve to the newest entry.
    pub fn register(&mut self, spec: ToolSpec) {
        if self.tools.iter().any(|tool| tool.name == spec.name) {
            tracing::warn!(tool = %spec.name, "registered tool shadows an existing tool with the same name");
        }
        tracing::info!(tool = %spec.name, index = self.tools.len(), "registered tool");
        self.tools.push(spec);
        self.version += 1;
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().rev().find(|tool| tool.name == name)
    }

    /// Returns false when no tool has that name. Setting the text a tool
    /// already has leaves the registry untouched.
    pub fn update_description(&mut self, name: &str, description: &str) -> bool {
        let mut found = false;
        let mut changed = false;
        for tool in self.tools.iter_mut().filter(|tool| tool.name == name) {
            found = true;
            if tool.description != description {
                tool.description = description.to_owned();
                changed = true;
            }
        }

        if changed {
            self.version += 1;
            tracing::info!(tool = name, "updated tool description");
        }
        found
    }

    pub fn remove_at(&mut self, index: usize) -> Result<ToolSpec> {
        if index >= self.tools.len() {
            return Err(Error::ToolIndexOutOfRange {
                index,
                len: self.tools.len(),
            });
        }

        let removed = self.tools.remove(index);
        self.version += 1;
        tracing::info!(tool = %removed.name, index, "removed tool");
        Ok(removed)
    }

    /// Removes the entry `name` resolves to.
    pub fn remove(&mut self, name: &str) -> Result<ToolSpec> {
        let index = self
            .tools
            .iter()
            .rposition(|tool| tool.name == name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;
        self.remove_at(index)
    }

    /// `(name, description)` pairs in registry order.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|tool| (tool.name.clone(), tool.description.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            version: self.version,
            tools: self.tools.clone().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::output::ToolOutput;
    use crate::tools::types::{InputSchema, ToolHandler};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Fixed(&'static str);

    #[async_trait]
    impl ToolHandler for Fixed {
        async fn call(&self, _args: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::text(self.0))
        }
    }

    fn tool(name: &str, reply: &'static str) -> ToolSpec {
        ToolSpec::new(name, format!("{name} tool"), InputSchema::new("Empty"), Arc::new(Fixed(reply)))
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(vec![tool("A", "a"), tool("B", "b"), tool("C", "c")])
    }

    fn names(registry: &ToolRegistry) -> Vec<String> {
        registry.iter().map(|tool| tool.name.clone()).collect()
    }

    #[test]
    fn remove_at_shifts_later_entries() {
        let mut registry = registry();
        let removed = registry.remove_at(1).expect("in range");

        assert_eq!(removed.name, "B");
        assert_eq!(names(&registry), ["A", "C"]);
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn remove_at_out_of_range_leaves_registry_untouched() {
        let mut registry = registry();
        let err = registry.remove_at(3).expect_err("out of range");

        assert!(matches!(err, Error::ToolIndexOutOfRange { index: 3, len: 3 }));
        assert_eq!(names(&registry), ["A", "B", "C"]);
        assert_eq!(registry.version(), 0);
    }

    #[test]
    fn update_description_is_idempotent() {
        let mut registry = registry();

        assert!(registry.update_description("B", "buy things"));
        let after_first = registry.snapshot();
        assert!(registry.update_description("B", "buy things"));
        let after_second = registry.snapshot();

        assert_eq!(after_first.version, after_second.version);
        assert_eq!(
            after_second.tools.iter().map(|t| t.description.as_str()).collect::<Vec<_>>(),
            ["A tool", "buy things", "C tool"]
        );
    }

    #[test]
    fn update_description_of_unknown_tool_is_noop() {
        let mut registry = registry();
        assert!(!registry.update_description("Z", "anything"));
        assert_eq!(registry.version(), 0);
    }

    #[tokio::test]
    async fn later_registration_shadows_earlier() {
        let mut registry = registry();
        registry.register(tool("B", "newer"));

        assert_eq!(registry.len(), 4);
        let resolved = registry.get("B").expect("resolves");
        assert_eq!(
            resolved.invoke(Value::Null).await.expect("invoke"),
            ToolOutput::text("newer")
        );

        let removed = registry.remove("B").expect("removes newest");
        assert_eq!(removed.handler.call(Value::Null).await.expect("call"), ToolOutput::text("newer"));
        assert_eq!(names(&registry), ["A", "B", "C"]);
    }

    #[test]
    fn remove_unknown_name_is_not_found() {
        let mut registry = registry();
        assert!(matches!(registry.remove("Z"), Err(Error::NotFound(_))));
    }

    #[test]
    fn snapshot_is_detached_from_later_changes() {
        let mut registry = registry();
        let before = registry.snapshot();
        registry.update_description("A", "changed");

        assert_eq!(before.tools[0].description, "A tool");
        assert!(registry.snapshot().version > before.version);
    }
}
