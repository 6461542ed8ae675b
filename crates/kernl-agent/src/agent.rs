use crate::tools::{Tool, ToolSet, Toolkit};
use crate::{HookBus, InputGuardrail, KernlError, OutputGuardrail};
use kernl_llm::{LanguageModel, ModelSettings, model_key};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub type InstructionsFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

#[derive(Clone)]
pub enum Instructions {
    Static(String),
    /// Computed from the thread context at each model call.
    Dynamic(InstructionsFn),
}

impl Instructions {
    pub fn resolve(&self, context: &Value) -> String {
        match self {
            Self::Static(text) => text.clone(),
            Self::Dynamic(build) => build(context),
        }
    }
}

impl Default for Instructions {
    fn default() -> Self {
        Self::Static(String::new())
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for Instructions {
    fn from(text: &str) -> Self {
        Self::Static(text.to_string())
    }
}

impl From<String> for Instructions {
    fn from(text: String) -> Self {
        Self::Static(text)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum OutputType {
    #[default]
    Text,
    /// The final message must be JSON matching `schema`.
    Structured { schema: Value },
}

impl OutputType {
    pub fn schema(&self) -> Option<&Value> {
        match self {
            Self::Text => None,
            Self::Structured { schema } => Some(schema),
        }
    }
}

/// A configured persona: instructions, a model, tools, and guardrails.
/// Agents are immutable once built and shared behind `Arc`.
pub struct Agent {
    id: String,
    name: String,
    description: Option<String>,
    instructions: Instructions,
    model: Arc<dyn LanguageModel>,
    model_settings: ModelSettings,
    toolkits: Vec<Arc<dyn Toolkit>>,
    input_guardrails: Vec<Arc<dyn InputGuardrail>>,
    output_guardrails: Vec<Arc<dyn OutputGuardrail>>,
    output: OutputType,
    hooks: HookBus,
}

impl Agent {
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(id, name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// `provider/modelId` as recorded on thread records.
    pub fn model_ref(&self) -> String {
        model_key(self.model.provider(), self.model.model_id())
    }

    pub fn model_settings(&self) -> &ModelSettings {
        &self.model_settings
    }

    pub fn toolkits(&self) -> &[Arc<dyn Toolkit>] {
        &self.toolkits
    }

    pub fn input_guardrails(&self) -> &[Arc<dyn InputGuardrail>] {
        &self.input_guardrails
    }

    pub fn output_guardrails(&self) -> &[Arc<dyn OutputGuardrail>] {
        &self.output_guardrails
    }

    pub fn output(&self) -> &OutputType {
        &self.output
    }

    pub fn hooks(&self) -> &HookBus {
        &self.hooks
    }

    /// System tools first, then every toolkit in declaration order.
    pub async fn tools(
        &self,
        system: Vec<Arc<dyn Tool>>,
        context: &Value,
    ) -> Result<ToolSet, KernlError> {
        ToolSet::assemble(system, &self.toolkits, context).await
    }

    /// Looks a tool up across toolkits; the first toolkit that has it wins.
    pub async fn find_tool(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        for toolkit in &self.toolkits {
            if let Some(tool) = toolkit.get(tool_id).await {
                return Some(tool);
            }
        }
        None
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.model_ref())
            .field("toolkits", &self.toolkits.len())
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

pub struct AgentBuilder {
    id: String,
    name: String,
    description: Option<String>,
    instructions: Instructions,
    model: Option<Arc<dyn LanguageModel>>,
    model_settings: ModelSettings,
    toolkits: Vec<Arc<dyn Toolkit>>,
    input_guardrails: Vec<Arc<dyn InputGuardrail>>,
    output_guardrails: Vec<Arc<dyn OutputGuardrail>>,
    output: OutputType,
    hooks: Option<HookBus>,
}

impl AgentBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            instructions: Instructions::default(),
            model: None,
            model_settings: ModelSettings::default(),
            toolkits: Vec::new(),
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            output: OutputType::Text,
            hooks: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn instructions(mut self, instructions: impl Into<Instructions>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn dynamic_instructions(
        mut self,
        build: impl Fn(&Value) -> String + Send + Sync + 'static,
    ) -> Self {
        self.instructions = Instructions::Dynamic(Arc::new(build));
        self
    }

    pub fn model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    pub fn toolkit(mut self, toolkit: Arc<dyn Toolkit>) -> Self {
        self.toolkits.push(toolkit);
        self
    }

    pub fn input_guardrail(mut self, guardrail: Arc<dyn InputGuardrail>) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    pub fn output_guardrail(mut self, guardrail: Arc<dyn OutputGuardrail>) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output = OutputType::Structured { schema };
        self
    }

    pub fn hooks(mut self, hooks: HookBus) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Result<Agent, KernlError> {
        if self.id.trim().is_empty() {
            return Err(KernlError::misconfiguration("agent id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(KernlError::misconfiguration(format!(
                "agent '{}' must have a name",
                self.id
            )));
        }
        let model = self.model.ok_or_else(|| {
            KernlError::misconfiguration(format!("agent '{}' has no model", self.id))
        })?;
        if let OutputType::Structured { schema } = &self.output {
            if !schema.is_object() {
                return Err(KernlError::misconfiguration(format!(
                    "agent '{}' output schema must be a JSON object",
                    self.id
                )));
            }
        }

        Ok(Agent {
            id: self.id,
            name: self.name,
            description: self.description,
            instructions: self.instructions,
            model,
            model_settings: self.model_settings,
            toolkits: self.toolkits,
            input_guardrails: self.input_guardrails,
            output_guardrails: self.output_guardrails,
            output: self.output,
            hooks: self.hooks.unwrap_or_default(),
        })
    }
}
