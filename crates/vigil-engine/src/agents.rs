use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::ToolCatalog;
use crate::tools::{delegate::DelegateTaskTool, find_files::FindFilesTool, write_file::WriteFileTool};

/// Agent kind that coordinates others. Never a valid delegation target.
pub const ORCHESTRATOR_KIND: &str = "orchestrator";

/// What the engine needs to run one agent kind.
pub struct AgentDefinition {
    pub kind: String,
    pub system_prompt: String,
    pub tools: Arc<ToolCatalog>,
}

/// Source of system prompts and tool catalogs, keyed by agent kind.
pub trait AgentDefinitionRegistry: Send + Sync {
    fn get(&self, agent_kind: &str) -> Option<Arc<AgentDefinition>>;
}

/// Fixed set of definitions assembled at startup.
#[derive(Default)]
pub struct StaticAgentRegistry {
    agents: HashMap<String, Arc<AgentDefinition>>,
}

impl StaticAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: &str, system_prompt: &str, tools: ToolCatalog) -> Self {
        self.agents.insert(
            kind.to_string(),
            Arc::new(AgentDefinition {
                kind: kind.to_string(),
                system_prompt: system_prompt.to_string(),
                tools: Arc::new(tools),
            }),
        );
        self
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.agents.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl AgentDefinitionRegistry for StaticAgentRegistry {
    fn get(&self, agent_kind: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(agent_kind).cloned()
    }
}

/// An orchestrator that searches and delegates, and a worker that can also write files.
pub fn demo_registry() -> StaticAgentRegistry {
    StaticAgentRegistry::new()
        .with(
            ORCHESTRATOR_KIND,
            "You coordinate work. Search the workspace with find_files and hand \
             self-contained subtasks to a worker with delegate_task.",
            ToolCatalog::new()
                .with(Arc::new(FindFilesTool))
                .with(Arc::new(DelegateTaskTool)),
        )
        .with(
            "worker",
            "You complete one task in the workspace. Writing files requires human approval.",
            ToolCatalog::new()
                .with(Arc::new(FindFilesTool))
                .with(Arc::new(WriteFileTool)),
        )
}
