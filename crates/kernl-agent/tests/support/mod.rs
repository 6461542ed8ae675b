#![allow(dead_code)]

use async_trait::async_trait;
use kernl_agent::{Agent, AgentRegistry, FunctionTool, StaticToolkit, Thread, Tool, ToolError};
use kernl_llm::{
    FinishReason, Item, LanguageModel, Message, ModelError, ModelRequest, ModelResponse, ToolCall,
    Usage,
};
use kernl_threadstore::{MemoryThreadStore, ThreadStore};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replays queued responses in order and records every request.
#[derive(Clone)]
pub struct SequenceModel {
    pub provider: String,
    pub model_id: String,
    pub responses: Arc<Mutex<VecDeque<Result<ModelResponse, ModelError>>>>,
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl SequenceModel {
    pub fn new(model_id: &str) -> Self {
        Self {
            provider: "test".to_string(),
            model_id: model_id.to_string(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn enqueue(&self, response: ModelResponse) -> &Self {
        self.responses
            .lock()
            .expect("responses mutex")
            .push_back(Ok(response));
        self
    }

    pub fn enqueue_error(&self, error: ModelError) -> &Self {
        self.responses
            .lock()
            .expect("responses mutex")
            .push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl LanguageModel for SequenceModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().expect("requests mutex").push(request);
        self.responses
            .lock()
            .expect("responses mutex")
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Configuration("no response queued".to_string())))
    }
}

/// Always answers with the same response, for models that loop forever.
pub struct RepeatModel {
    pub model_id: String,
    pub response: ModelResponse,
}

#[async_trait]
impl LanguageModel for RepeatModel {
    fn provider(&self) -> &str {
        "test"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
        Ok(self.response.clone())
    }
}

pub fn usage() -> Usage {
    Usage {
        input_tokens: 1,
        output_tokens: 1,
        total_tokens: 2,
        reasoning_tokens: None,
    }
}

pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        content: vec![Item::Message(Message::assistant(text))],
        finish_reason: FinishReason::Stop,
        usage: usage(),
        warnings: Vec::new(),
    }
}

pub fn tool_call_response(calls: Vec<(&str, &str, Value)>) -> ModelResponse {
    ModelResponse {
        content: calls
            .into_iter()
            .map(|(call_id, tool_id, arguments)| {
                Item::ToolCall(ToolCall::new(call_id, tool_id, arguments.to_string()))
            })
            .collect(),
        finish_reason: FinishReason::ToolCalls,
        usage: usage(),
        warnings: Vec::new(),
    }
}

pub fn handoff_response(call_id: &str, to: &str, message: &str) -> ModelResponse {
    tool_call_response(vec![(
        call_id,
        "handoff",
        json!({"to": to, "message": message}),
    )])
}

pub fn weather_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        "get_weather",
        "Current weather for a city",
        json!({
            "type": "object",
            "required": ["city"],
            "properties": {"city": {"type": "string"}},
            "additionalProperties": false
        }),
        |_context, arguments| async move {
            let city = arguments["city"]
                .as_str()
                .ok_or_else(|| ToolError::Validation("city must be a string".to_string()))?
                .to_string();
            Ok(json!({"city": city, "forecast": "sunny"}))
        },
    ))
}

pub fn agent_with_tools(id: &str, model: Arc<dyn LanguageModel>, tools: Vec<Arc<dyn Tool>>) -> Arc<Agent> {
    let mut builder = Agent::builder(id, id.to_uppercase())
        .instructions(format!("You are {id}."))
        .model(model);
    if !tools.is_empty() {
        builder = builder.toolkit(Arc::new(StaticToolkit::new(format!("{id}-tools"), tools)));
    }
    Arc::new(builder.build().expect("agent should build"))
}

pub fn agent(id: &str, model: Arc<dyn LanguageModel>) -> Arc<Agent> {
    agent_with_tools(id, model, Vec::new())
}

pub fn memory_store() -> Arc<dyn ThreadStore> {
    Arc::new(MemoryThreadStore::new())
}

pub fn thread_for(agent: Arc<Agent>, store: Arc<dyn ThreadStore>) -> Thread {
    let agents = AgentRegistry::new();
    agents.register(agent.clone()).expect("register agent");
    Thread::new(agent, agents, store)
}
