use crate::{HandoffRecord, KernlError, ThreadOutcome};
use kernl_llm::{Item, Message, ToolCall, Usage};
use kernl_threadstore::{ThreadEvent, ThreadState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub enum ThreadInput {
    Text(String),
    Items(Vec<Item>),
}

impl ThreadInput {
    pub fn into_items(self) -> Vec<Item> {
        match self {
            Self::Text(text) => vec![Item::Message(Message::user(text))],
            Self::Items(items) => items,
        }
    }
}

impl From<&str> for ThreadInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for ThreadInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<Item>> for ThreadInput {
    fn from(items: Vec<Item>) -> Self {
        Self::Items(items)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    /// Resume this thread when it exists in the store; otherwise create it
    /// under this id.
    pub thread_id: Option<String>,
    pub namespace: Option<String>,
    /// Initial context for a new thread. Ignored when resuming.
    pub context: Option<Value>,
    pub max_handoffs: Option<usize>,
    pub metadata: Map<String, Value>,
    pub parent_task_id: Option<String>,
    /// Decisions for tool calls left awaiting approval, keyed by call id.
    pub approvals: HashMap<String, ApprovalDecision>,
}

impl RunOptions {
    pub fn resume(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Self::default()
        }
    }

    pub fn approve(mut self, call_id: impl Into<String>) -> Self {
        self.approvals
            .insert(call_id.into(), ApprovalDecision::Approve);
        self
    }

    pub fn deny(mut self, call_id: impl Into<String>) -> Self {
        self.approvals.insert(call_id.into(), ApprovalDecision::Deny);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ThreadOutput {
    Text(String),
    Structured(Value),
}

impl ThreadOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadExecuteResult {
    pub tid: String,
    /// `None` when the execution was interrupted for approvals.
    pub response: Option<ThreadOutput>,
    pub outcome: ThreadOutcome,
    pub state: ThreadState,
    /// The agent active when the execution ended.
    pub final_agent: String,
    pub handoff_chain: Vec<HandoffRecord>,
    pub usage: Usage,
    pub pending_approvals: Vec<ToolCall>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// An event as it was appended to the thread log.
    Event(ThreadEvent),
    Handoff(HandoffRecord),
    Finish(ThreadExecuteResult),
}

pub(crate) type StreamItem = Result<StreamEvent, KernlError>;
