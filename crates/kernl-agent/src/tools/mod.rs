mod dispatch;
mod toolkit;

use crate::{KernlError, ThreadContext, ToolError};
use async_trait::async_trait;
use kernl_llm::ToolDefinition;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use dispatch::{ActionSet, DispatchReport, DispatchedCall, ToolDispatcher};
pub use toolkit::{DynamicToolkit, StaticToolkit, Toolkit};

/// What a tool invocation sees of the running thread.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub thread_id: String,
    pub agent_id: String,
    pub call_id: String,
    pub context: ThreadContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandoffRequest {
    pub to: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Completed(Value),
    Failed(String),
    /// Only the system handoff tool produces this.
    Handoff(HandoffRequest),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the argument object.
    fn parameters(&self) -> Value;

    /// Gated calls are recorded but not run until the caller approves them.
    fn requires_approval(&self, _arguments: &Value) -> bool {
        false
    }

    async fn invoke(&self, context: ToolContext, arguments: Value)
    -> Result<ToolOutcome, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.id().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(ToolContext, Value) -> ToolFuture + Send + Sync>;
pub type ApprovalPolicy = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A tool backed by an async closure.
#[derive(Clone)]
pub struct FunctionTool {
    definition: ToolDefinition,
    executor: ToolExecutor,
    approval: Option<ApprovalPolicy>,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        execute: F,
    ) -> Self
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        let executor: ToolExecutor = Arc::new(move |context, arguments| {
            Box::pin(execute(context, arguments)) as ToolFuture
        });
        Self {
            definition: ToolDefinition {
                name: id.into(),
                description: description.into(),
                parameters,
            },
            executor,
            approval: None,
        }
    }

    pub fn requiring_approval(self) -> Self {
        self.with_approval_policy(|_| true)
    }

    pub fn with_approval_policy(
        mut self,
        policy: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.approval = Some(Arc::new(policy));
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn id(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters(&self) -> Value {
        self.definition.parameters.clone()
    }

    fn requires_approval(&self, arguments: &Value) -> bool {
        self.approval
            .as_ref()
            .is_some_and(|policy| policy(arguments))
    }

    async fn invoke(
        &self,
        context: ToolContext,
        arguments: Value,
    ) -> Result<ToolOutcome, ToolError> {
        (self.executor)(context, arguments)
            .await
            .map(ToolOutcome::Completed)
    }
}

/// The tools visible to one model call: system tools first, then each
/// toolkit's listing in declaration order.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub async fn assemble(
        system: Vec<Arc<dyn Tool>>,
        toolkits: &[Arc<dyn Toolkit>],
        context: &Value,
    ) -> Result<Self, KernlError> {
        let mut tools = system;
        for toolkit in toolkits {
            tools.extend(toolkit.list(context).await?);
        }

        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.id().to_string()) {
                return Err(KernlError::misconfiguration(format!(
                    "duplicate tool id '{}'",
                    tool.id()
                )));
            }
        }
        Ok(Self { tools })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.id().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

pub(crate) fn parse_tool_arguments(tool_id: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str::<Value>(raw).map_err(|error| {
        ToolError::Validation(format!(
            "invalid JSON arguments for tool '{tool_id}': {error}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool(id: &str) -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            id,
            "echo arguments",
            json!({"type": "object"}),
            |_context, arguments| async move { Ok(arguments) },
        ))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_set_lists_system_tools_before_toolkits() {
        let toolkit: Arc<dyn Toolkit> =
            Arc::new(StaticToolkit::new("kit", vec![echo_tool("b"), echo_tool("c")]));
        let tools = ToolSet::assemble(vec![echo_tool("a")], &[toolkit], &json!({}))
            .await
            .expect("assemble should succeed");
        assert_eq!(tools.ids(), vec!["a", "b", "c"]);
        assert_eq!(tools.definitions()[0].name, "a");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_set_rejects_duplicate_ids() {
        let toolkit: Arc<dyn Toolkit> = Arc::new(StaticToolkit::new("kit", vec![echo_tool("a")]));
        let error = ToolSet::assemble(vec![echo_tool("a")], &[toolkit], &json!({}))
            .await
            .err()
            .expect("duplicate id should fail");
        assert!(matches!(error, KernlError::Misconfiguration(_)));
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        assert_eq!(
            parse_tool_arguments("t", "  ").expect("empty is allowed"),
            json!({})
        );
        assert!(matches!(
            parse_tool_arguments("t", "{not json"),
            Err(ToolError::Validation(_))
        ));
    }

    #[test]
    fn approval_policy_inspects_arguments() {
        let tool = FunctionTool::new("pay", "pay", json!({"type": "object"}), |_c, a| async move {
            Ok(a)
        })
        .with_approval_policy(|arguments| arguments["amount"].as_u64().unwrap_or(0) > 100);
        assert!(!tool.requires_approval(&json!({"amount": 5})));
        assert!(tool.requires_approval(&json!({"amount": 500})));
    }
}
