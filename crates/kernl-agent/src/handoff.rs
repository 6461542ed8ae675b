use crate::tools::{HandoffRequest, Tool, ToolContext, ToolOutcome};
use crate::{KernlError, ToolError};
use async_trait::async_trait;
use kernl_threadstore::{ThreadEvent, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const HANDOFF_TOOL: &str = "handoff";

/// System tool through which a model passes the conversation to another
/// registered agent.
pub struct HandoffTool {
    targets: Vec<String>,
}

impl HandoffTool {
    /// With no targets the `to` argument is an open string and the runtime
    /// rejects whatever the model picks.
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Tool for HandoffTool {
    fn id(&self) -> &str {
        HANDOFF_TOOL
    }

    fn description(&self) -> &str {
        "Hand the conversation off to another agent. Provide the target agent id and a message explaining what it should do."
    }

    fn parameters(&self) -> Value {
        let to = if self.targets.is_empty() {
            json!({"type": "string"})
        } else {
            json!({"type": "string", "enum": self.targets})
        };
        json!({
            "type": "object",
            "required": ["to", "message"],
            "properties": {
                "to": to,
                "message": {"type": "string"}
            },
            "additionalProperties": false
        })
    }

    async fn invoke(
        &self,
        _context: ToolContext,
        arguments: Value,
    ) -> Result<ToolOutcome, ToolError> {
        let to = string_field(&arguments, "to")
            .ok_or_else(|| ToolError::Validation("argument 'to' must be a string".to_string()))?;
        let message = string_field(&arguments, "message").ok_or_else(|| {
            ToolError::Validation("argument 'message' must be a string".to_string())
        })?;
        Ok(ToolOutcome::Handoff(HandoffRequest { to, message }))
    }
}

/// One completed transfer between agents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub from: String,
    pub to: String,
    pub message: String,
    pub timestamp: Timestamp,
}

/// The value recorded as the handoff tool's result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffPayload {
    pub from: String,
    pub to: String,
    pub message: String,
}

impl HandoffPayload {
    pub fn to_value(&self) -> Value {
        json!({
            "kind": "handoff",
            "from": self.from,
            "to": self.to,
            "message": self.message,
        })
    }
}

impl From<&HandoffRecord> for HandoffPayload {
    fn from(record: &HandoffRecord) -> Self {
        Self {
            from: record.from.clone(),
            to: record.to.clone(),
            message: record.message.clone(),
        }
    }
}

/// Recognizes a handoff payload at the top level of `value` or under its
/// `output` field. Anything else, including a payload with a non-string
/// field, yields `None`.
pub fn extract_handoff(value: &Value) -> Option<HandoffPayload> {
    payload_at(value).or_else(|| value.get("output").and_then(payload_at))
}

fn payload_at(value: &Value) -> Option<HandoffPayload> {
    if value.get("kind").and_then(Value::as_str) != Some("handoff") {
        return None;
    }
    Some(HandoffPayload {
        from: string_field(value, "from")?,
        to: string_field(value, "to")?,
        message: string_field(value, "message")?,
    })
}

/// Every handoff recorded in a thread log, oldest first when `events` is.
pub fn handoffs_in_history(events: &[ThreadEvent]) -> Vec<HandoffPayload> {
    events
        .iter()
        .filter_map(|event| event.item.as_tool_result())
        .filter(|result| result.tool_id == HANDOFF_TOOL)
        .filter_map(|result| result.result.as_ref().and_then(extract_handoff))
        .collect()
}

/// Renders `a → b → c` from consecutive records.
pub fn format_chain(chain: &[HandoffRecord]) -> String {
    let Some(first) = chain.first() else {
        return String::new();
    };
    let mut parts = vec![first.from.as_str()];
    parts.extend(chain.iter().map(|record| record.to.as_str()));
    parts.join(" → ")
}

/// Handoffs performed during one execution, bounded by an optional ceiling.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandoffChain {
    records: Vec<HandoffRecord>,
    limit: Option<usize>,
}

impl HandoffChain {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            records: Vec::new(),
            limit,
        }
    }

    /// Rejects the record once the chain would grow past the ceiling. The
    /// error carries the chain including the rejected record.
    pub fn push(&mut self, record: HandoffRecord) -> Result<(), KernlError> {
        if let Some(limit) = self.limit {
            if self.records.len() >= limit {
                let mut chain = self.records.clone();
                chain.push(record);
                return Err(KernlError::MaxHandoffsExceeded { limit, chain });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[HandoffRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<HandoffRecord> {
        self.records
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
