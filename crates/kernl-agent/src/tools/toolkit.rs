use super::Tool;
use crate::KernlError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// A named group of tools an agent exposes to its model.
#[async_trait]
pub trait Toolkit: Send + Sync {
    fn id(&self) -> &str;

    /// Tools available for the given thread context. Called once per tick.
    async fn list(&self, context: &Value) -> Result<Vec<Arc<dyn Tool>>, KernlError>;

    async fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>>;
}

pub struct StaticToolkit {
    id: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolkit {
    pub fn new(id: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            id: id.into(),
            tools,
        }
    }
}

#[async_trait]
impl Toolkit for StaticToolkit {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list(&self, _context: &Value) -> Result<Vec<Arc<dyn Tool>>, KernlError> {
        Ok(self.tools.clone())
    }

    async fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.id() == tool_id).cloned()
    }
}

pub type ToolLister = Arc<dyn Fn(&Value) -> Vec<Arc<dyn Tool>> + Send + Sync>;

/// Computes its tools from the thread context on every listing. `get` sees
/// the most recent listing.
pub struct DynamicToolkit {
    id: String,
    lister: ToolLister,
    last_listing: Mutex<Vec<Arc<dyn Tool>>>,
}

impl DynamicToolkit {
    pub fn new(
        id: impl Into<String>,
        lister: impl Fn(&Value) -> Vec<Arc<dyn Tool>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            lister: Arc::new(lister),
            last_listing: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Toolkit for DynamicToolkit {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list(&self, context: &Value) -> Result<Vec<Arc<dyn Tool>>, KernlError> {
        let tools = (self.lister)(context);
        *self
            .last_listing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tools.clone();
        Ok(tools)
    }

    async fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.last_listing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|tool| tool.id() == tool_id)
            .cloned()
    }
}
