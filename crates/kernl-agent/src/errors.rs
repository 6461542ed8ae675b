use crate::guardrails::GuardrailPhase;
use crate::handoff::{HandoffRecord, format_chain};
use kernl_llm::ModelError;
use kernl_threadstore::StoreError;
use serde_json::Value;
use thiserror::Error;

/// Top-level error type for the kernl-agent crate.
///
/// Tool failures never show up here: they become error tool results and go
/// back to the model.
#[derive(Debug, Error)]
pub enum KernlError {
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),
    #[error(
        "handoff target '{target}' not found; available agents: [{}]",
        .available.join(", ")
    )]
    HandoffTargetNotFound {
        target: String,
        available: Vec<String>,
    },
    #[error("max handoffs exceeded (limit {limit}): {}", format_chain(.chain))]
    MaxHandoffsExceeded {
        limit: usize,
        chain: Vec<HandoffRecord>,
    },
    #[error("{phase} guardrail '{guardrail}' tripwire triggered")]
    GuardrailTripwire {
        phase: GuardrailPhase,
        guardrail: String,
        output_info: Value,
    },
    #[error("output parse failed: {0}")]
    OutputParse(String),
    #[error("thread {0} aborted")]
    Aborted(String),
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl KernlError {
    pub fn misconfiguration(message: impl Into<String>) -> Self {
        Self::Misconfiguration(message.into())
    }
}

/// Error a tool body returns. Converted to an error tool result by the
/// dispatcher.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool validation failed: {0}")]
    Validation(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
}
