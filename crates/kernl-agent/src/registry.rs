use crate::{Agent, KernlError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Agents reachable as handoff targets, keyed by id. Clones share the map.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, Arc<Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an id twice replaces the earlier agent.
    pub fn register(&self, agent: Arc<Agent>) -> Result<Option<Arc<Agent>>, KernlError> {
        let mut agents = self
            .agents
            .write()
            .map_err(|_| KernlError::misconfiguration("agent registry lock poisoned"))?;
        Ok(agents.insert(agent.id().to_string(), agent))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().ok()?.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .map(|agents| agents.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.read().map(|agents| agents.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
