use kernl_llm::{Item, Message, MessagePart, Role, ToolCall};
use kernl_threadstore::{ThreadEvent, now_millis};
use serde_json::Map;

/// A model response regrouped into the order it is recorded: one collapsed
/// assistant message, then reasoning and other items, then tool calls.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ResponseItems {
    pub message: Option<Message>,
    pub other: Vec<Item>,
    pub tool_calls: Vec<ToolCall>,
}

impl ResponseItems {
    pub fn text(&self) -> String {
        self.message.as_ref().map(Message::text).unwrap_or_default()
    }
}

pub(crate) fn split_response(content: Vec<Item>) -> ResponseItems {
    let mut parts: Vec<MessagePart> = Vec::new();
    let mut other = Vec::new();
    let mut tool_calls = Vec::new();
    for item in content {
        match item {
            Item::Message(message) => parts.extend(message.content),
            Item::ToolCall(call) => tool_calls.push(call),
            item => other.push(item),
        }
    }
    let message = (!parts.is_empty()).then(|| Message {
        role: Role::Assistant,
        content: parts,
    });
    ResponseItems {
        message,
        other,
        tool_calls,
    }
}

pub(crate) fn new_event(tid: &str, seq: u64, item: Item) -> ThreadEvent {
    ThreadEvent {
        id: uuid::Uuid::new_v4().to_string(),
        tid: tid.to_string(),
        seq,
        timestamp: now_millis(),
        metadata: Map::new(),
        item,
    }
}

/// Tool calls in `events` that were held for approval and have no result
/// yet, oldest first.
pub(crate) fn unresolved_approvals(events: &[ThreadEvent]) -> Vec<ToolCall> {
    let answered: std::collections::HashSet<&str> = events
        .iter()
        .filter_map(|event| event.item.as_tool_result())
        .map(|result| result.call_id.as_str())
        .collect();
    events
        .iter()
        .filter_map(|event| event.item.as_tool_call())
        .filter(|call| call.state == kernl_llm::ToolCallState::RequiresApproval)
        .filter(|call| !answered.contains(call.call_id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernl_llm::{ToolCallState, ToolResult};
    use serde_json::json;

    #[test]
    fn split_collapses_messages_and_moves_tool_calls_last() {
        let content = vec![
            Item::ToolCall(ToolCall::new("c1", "lookup", "{}")),
            Item::Message(Message::assistant("Hello, ")),
            Item::reasoning("thinking"),
            Item::Message(Message::assistant("world")),
        ];
        let split = split_response(content);
        assert_eq!(split.text(), "Hello, world");
        assert_eq!(split.message.as_ref().map(|m| m.content.len()), Some(2));
        assert_eq!(split.other, vec![Item::reasoning("thinking")]);
        assert_eq!(split.tool_calls.len(), 1);
    }

    #[test]
    fn split_without_messages_has_no_message() {
        let split = split_response(vec![Item::ToolCall(ToolCall::new("c1", "t", "{}"))]);
        assert!(split.message.is_none());
        assert_eq!(split.text(), "");
    }

    #[test]
    fn unresolved_approvals_skip_answered_calls() {
        let mut gated = ToolCall::new("c1", "transfer", "{}");
        gated.state = ToolCallState::RequiresApproval;
        let mut answered = ToolCall::new("c2", "transfer", "{}");
        answered.state = ToolCallState::RequiresApproval;
        let events = vec![
            new_event("t", 0, Item::ToolCall(gated.clone())),
            new_event("t", 1, Item::ToolCall(answered)),
            new_event("t", 2, Item::ToolCall(ToolCall::new("c3", "free", "{}"))),
            new_event(
                "t",
                3,
                Item::ToolResult(ToolResult::completed("c2", "transfer", json!("ok"))),
            ),
        ];
        assert_eq!(unresolved_approvals(&events), vec![gated]);
    }
}
