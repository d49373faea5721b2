use std::collections::HashMap;
use std::sync::Arc;

use vigil_core::tools::{Tool, ToolClassification, ToolDefinition};

/// Named tools available to one agent kind.
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Classification of a registered tool. Unknown names are treated as safe:
    /// executing them yields an error result, never a side effect.
    pub fn classify(&self, name: &str) -> ToolClassification {
        self.tools
            .get(name)
            .map(|t| t.classification())
            .unwrap_or(ToolClassification::Safe)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the oracle, sorted by name. Definitions never carry
    /// an invocable handle, so dangerous tools can only be proposed.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// `(safe, dangerous)` definitions.
    pub fn partition(&self) -> (Vec<ToolDefinition>, Vec<ToolDefinition>) {
        self.definitions()
            .into_iter()
            .partition(|d| !d.requires_approval())
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vigil_core::tools::{ToolContext, ToolError, ToolOutput};

    struct DummyTool {
        name: String,
        classification: ToolClassification,
    }

    impl DummyTool {
        fn new(name: &str, classification: ToolClassification) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                classification,
            })
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn classification(&self) -> ToolClassification {
            self.classification
        }
        async fn invoke(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text("ok"))
        }
    }

    #[test]
    fn register_and_get() {
        let catalog = ToolCatalog::new().with(DummyTool::new("find_files", ToolClassification::Safe));
        assert!(catalog.contains("find_files"));
        assert!(!catalog.contains("write_file"));
        assert!(catalog.get("find_files").is_some());
        assert_eq!(catalog.count(), 1);
    }

    #[test]
    fn names_and_definitions_sorted() {
        let catalog = ToolCatalog::new()
            .with(DummyTool::new("write_file", ToolClassification::Dangerous))
            .with(DummyTool::new("find_files", ToolClassification::Safe))
            .with(DummyTool::new("delegate_task", ToolClassification::Safe));

        assert_eq!(catalog.names(), vec!["delegate_task", "find_files", "write_file"]);
        let defs = catalog.definitions();
        assert_eq!(defs[0].name, "delegate_task");
        assert_eq!(defs[2].name, "write_file");
    }

    #[test]
    fn partition_by_classification() {
        let catalog = ToolCatalog::new()
            .with(DummyTool::new("write_file", ToolClassification::Dangerous))
            .with(DummyTool::new("find_files", ToolClassification::Safe));

        let (safe, dangerous) = catalog.partition();
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].name, "find_files");
        assert_eq!(dangerous.len(), 1);
        assert_eq!(dangerous[0].name, "write_file");
    }

    #[test]
    fn unknown_tools_classify_as_safe() {
        let catalog = ToolCatalog::new().with(DummyTool::new("write_file", ToolClassification::Dangerous));
        assert_eq!(catalog.classify("write_file"), ToolClassification::Dangerous);
        assert_eq!(catalog.classify("nope"), ToolClassification::Safe);
    }

    #[test]
    fn register_replaces_same_name() {
        let mut catalog = ToolCatalog::new();
        catalog.register(DummyTool::new("find_files", ToolClassification::Safe));
        catalog.register(DummyTool::new("find_files", ToolClassification::Dangerous));
        assert_eq!(catalog.count(), 1);
        assert_eq!(catalog.classify("find_files"), ToolClassification::Dangerous);
    }
}
