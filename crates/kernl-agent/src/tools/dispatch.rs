use super::{Tool, ToolContext, ToolOutcome, ToolSet, parse_tool_arguments};
use crate::schema::validate_tool_arguments;
use crate::{HandoffPayload, HookEmitter, HookEvent, HookEventKind, KernlError, ThreadContext};
use futures::future::join_all;
use kernl_llm::{ToolCall, ToolCallState};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, debug, info_span, warn};

enum PlannedCall {
    Run {
        tool: Arc<dyn Tool>,
        arguments: Value,
    },
    Reject {
        arguments: Value,
        error: String,
    },
    AwaitApproval,
}

/// Tool calls from one model response, each resolved to what the dispatcher
/// will do with it. Unknown tools and bad arguments are settled here as
/// error results; they never reach a tool body.
pub struct ActionSet {
    entries: Vec<(ToolCall, PlannedCall)>,
}

impl ActionSet {
    pub fn plan(calls: Vec<ToolCall>, tools: &ToolSet) -> Self {
        Self::plan_with(calls, tools, true)
    }

    /// Plans calls the caller already approved, skipping the approval gate.
    pub fn approved(calls: Vec<ToolCall>, tools: &ToolSet) -> Self {
        Self::plan_with(calls, tools, false)
    }

    pub fn denied(calls: Vec<ToolCall>) -> Self {
        let entries = calls
            .into_iter()
            .map(|call| {
                let arguments = parse_tool_arguments(&call.tool_id, &call.arguments)
                    .unwrap_or(Value::Null);
                let planned = PlannedCall::Reject {
                    arguments,
                    error: "tool call denied".to_string(),
                };
                (call, planned)
            })
            .collect();
        Self { entries }
    }

    fn plan_with(calls: Vec<ToolCall>, tools: &ToolSet, gate: bool) -> Self {
        let mut entries = Vec::with_capacity(calls.len());
        for mut call in calls {
            let Some(tool) = tools.get(&call.tool_id) else {
                let error = format!("tool '{}' not found", call.tool_id);
                entries.push((
                    call,
                    PlannedCall::Reject {
                        arguments: Value::Null,
                        error,
                    },
                ));
                continue;
            };

            let arguments = match parse_tool_arguments(&call.tool_id, &call.arguments) {
                Ok(arguments) => arguments,
                Err(error) => {
                    entries.push((
                        call,
                        PlannedCall::Reject {
                            arguments: Value::Null,
                            error: error.to_string(),
                        },
                    ));
                    continue;
                }
            };

            let planned = if let Err(error) =
                validate_tool_arguments(&tool.parameters(), &arguments)
            {
                PlannedCall::Reject {
                    arguments,
                    error: format!("invalid arguments for tool '{}': {error}", call.tool_id),
                }
            } else if gate && tool.requires_approval(&arguments) {
                call.state = ToolCallState::RequiresApproval;
                PlannedCall::AwaitApproval
            } else {
                PlannedCall::Run {
                    tool: tool.clone(),
                    arguments,
                }
            };
            entries.push((call, planned));
        }
        Self { entries }
    }

    /// The calls as they should be recorded; gated calls carry the
    /// `requires_approval` state.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.entries.iter().map(|(call, _)| call.clone()).collect()
    }

    pub fn pending_approvals(&self) -> Vec<ToolCall> {
        self.entries
            .iter()
            .filter(|(_, planned)| matches!(planned, PlannedCall::AwaitApproval))
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub fn extend(&mut self, other: ActionSet) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchedCall {
    pub call: ToolCall,
    pub outcome: ToolOutcome,
}

/// Results come back in the order the model issued the calls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    pub results: Vec<DispatchedCall>,
    pub pending_approvals: Vec<ToolCall>,
}

pub struct ToolDispatcher<'a> {
    hooks: &'a dyn HookEmitter,
    thread_id: &'a str,
    agent_id: &'a str,
    context: &'a ThreadContext,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(
        hooks: &'a dyn HookEmitter,
        thread_id: &'a str,
        agent_id: &'a str,
        context: &'a ThreadContext,
    ) -> Self {
        Self {
            hooks,
            thread_id,
            agent_id,
            context,
        }
    }

    /// Runs every executable call concurrently. A failing tool only fails
    /// its own result; hook errors abort the whole dispatch.
    pub async fn dispatch(&self, actions: ActionSet) -> Result<DispatchReport, KernlError> {
        let mut pending_approvals = Vec::new();
        let mut work = Vec::new();
        for (call, planned) in actions.entries {
            match planned {
                PlannedCall::AwaitApproval => pending_approvals.push(call),
                planned => work.push((call, planned)),
            }
        }
        debug!(
            thread_id = self.thread_id,
            calls = work.len(),
            pending = pending_approvals.len(),
            "dispatching tool calls"
        );

        let results = join_all(
            work.into_iter()
                .map(|(call, planned)| self.dispatch_single(call, planned)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        Ok(DispatchReport {
            results,
            pending_approvals,
        })
    }

    async fn dispatch_single(
        &self,
        call: ToolCall,
        planned: PlannedCall,
    ) -> Result<DispatchedCall, KernlError> {
        let arguments = match &planned {
            PlannedCall::Run { arguments, .. } | PlannedCall::Reject { arguments, .. } => {
                arguments.clone()
            }
            PlannedCall::AwaitApproval => Value::Null,
        };
        self.emit(HookEventKind::ToolCallStart {
            call_id: call.call_id.clone(),
            tool_id: call.tool_id.clone(),
            arguments,
        })?;

        let outcome = match planned {
            PlannedCall::Run { tool, arguments } => {
                let context = ToolContext {
                    thread_id: self.thread_id.to_string(),
                    agent_id: self.agent_id.to_string(),
                    call_id: call.call_id.clone(),
                    context: self.context.clone(),
                };
                let span = info_span!(
                    "tool.call",
                    tool = %call.tool_id,
                    call_id = %call.call_id
                );
                tool.invoke(context, arguments)
                    .instrument(span)
                    .await
                    .unwrap_or_else(|error| ToolOutcome::Failed(error.to_string()))
            }
            PlannedCall::Reject { error, .. } => ToolOutcome::Failed(error),
            PlannedCall::AwaitApproval => {
                return Err(KernlError::misconfiguration(format!(
                    "tool call {} is awaiting approval",
                    call.call_id
                )));
            }
        };

        let (state, result, error) = match &outcome {
            ToolOutcome::Completed(value) => (ToolCallState::Completed, Some(value.clone()), None),
            ToolOutcome::Failed(message) => {
                warn!(
                    thread_id = self.thread_id,
                    tool = %call.tool_id,
                    call_id = %call.call_id,
                    error = %message,
                    "tool call failed"
                );
                (ToolCallState::Error, None, Some(message.clone()))
            }
            ToolOutcome::Handoff(request) => {
                let payload = HandoffPayload {
                    from: self.agent_id.to_string(),
                    to: request.to.clone(),
                    message: request.message.clone(),
                };
                (ToolCallState::Completed, Some(payload.to_value()), None)
            }
        };
        self.emit(HookEventKind::ToolCallEnd {
            call_id: call.call_id.clone(),
            tool_id: call.tool_id.clone(),
            state,
            result,
            error,
        })?;

        Ok(DispatchedCall { call, outcome })
    }

    fn emit(&self, kind: HookEventKind) -> Result<(), KernlError> {
        self.hooks.emit(HookEvent::new(
            self.thread_id,
            self.agent_id,
            self.context.snapshot(),
            kind,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferedHookEmitter, FunctionTool, HandoffTool, ToolError, extract_handoff};
    use serde_json::json;
    use std::time::Duration;

    fn tools() -> ToolSet {
        let slow: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "slow",
            "sleeps then answers",
            json!({"type": "object"}),
            |_context, _arguments| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!("slow done"))
            },
        ));
        let broken: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "broken",
            "always fails",
            json!({"type": "object"}),
            |_context, _arguments| async move {
                Err(ToolError::Execution("boom".to_string()))
            },
        ));
        let gated: Arc<dyn Tool> = Arc::new(
            FunctionTool::new(
                "transfer",
                "moves money",
                json!({
                    "type": "object",
                    "required": ["amount"],
                    "properties": {"amount": {"type": "integer"}}
                }),
                |_context, arguments| async move { Ok(arguments) },
            )
            .requiring_approval(),
        );
        ToolSet {
            tools: vec![slow, broken, gated],
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failing_tool_does_not_block_siblings() {
        let hooks = BufferedHookEmitter::default();
        let context = ThreadContext::default();
        let dispatcher = ToolDispatcher::new(&hooks, "t1", "agent-a", &context);
        let actions = ActionSet::plan(
            vec![
                ToolCall::new("c1", "slow", "{}"),
                ToolCall::new("c2", "broken", "{}"),
            ],
            &tools(),
        );

        let report = dispatcher.dispatch(actions).await.expect("dispatch");

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].call.call_id, "c1");
        assert_eq!(
            report.results[0].outcome,
            ToolOutcome::Completed(json!("slow done"))
        );
        assert_eq!(
            report.results[1].outcome,
            ToolOutcome::Failed("tool execution failed: boom".to_string())
        );
        assert_eq!(hooks.names().len(), 4);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_tool_and_bad_arguments_become_error_results() {
        let hooks = BufferedHookEmitter::default();
        let context = ThreadContext::default();
        let dispatcher = ToolDispatcher::new(&hooks, "t1", "agent-a", &context);
        let actions = ActionSet::approved(
            vec![
                ToolCall::new("c1", "nope", "{}"),
                ToolCall::new("c2", "transfer", "{\"amount\": \"lots\"}"),
                ToolCall::new("c3", "slow", "{oops"),
            ],
            &tools(),
        );

        let report = dispatcher.dispatch(actions).await.expect("dispatch");
        let errors: Vec<&ToolOutcome> = report.results.iter().map(|r| &r.outcome).collect();
        assert_eq!(errors[0], &ToolOutcome::Failed("tool 'nope' not found".to_string()));
        assert!(matches!(
            errors[1],
            ToolOutcome::Failed(message) if message.starts_with("invalid arguments for tool 'transfer'")
        ));
        assert!(matches!(errors[2], ToolOutcome::Failed(message) if message.contains("invalid JSON")));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn approval_gated_calls_are_held_back() {
        let hooks = BufferedHookEmitter::default();
        let context = ThreadContext::default();
        let actions = ActionSet::plan(
            vec![
                ToolCall::new("c1", "transfer", "{\"amount\": 10}"),
                ToolCall::new("c2", "slow", "{}"),
            ],
            &tools(),
        );
        let recorded = actions.tool_calls();
        assert_eq!(recorded[0].state, ToolCallState::RequiresApproval);
        assert_eq!(recorded[1].state, ToolCallState::Completed);
        assert_eq!(actions.pending_approvals().len(), 1);

        let report = ToolDispatcher::new(&hooks, "t1", "agent-a", &context)
            .dispatch(actions)
            .await
            .expect("dispatch");
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.pending_approvals[0].call_id, "c1");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn denied_calls_report_denial() {
        let hooks = BufferedHookEmitter::default();
        let context = ThreadContext::default();
        let report = ToolDispatcher::new(&hooks, "t1", "agent-a", &context)
            .dispatch(ActionSet::denied(vec![ToolCall::new(
                "c1",
                "transfer",
                "{\"amount\": 10}",
            )]))
            .await
            .expect("dispatch");
        assert_eq!(
            report.results[0].outcome,
            ToolOutcome::Failed("tool call denied".to_string())
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handoff_end_event_carries_the_recorded_payload() {
        let hooks = BufferedHookEmitter::default();
        let context = ThreadContext::default();
        let handoff: Arc<dyn Tool> = Arc::new(HandoffTool::new(vec!["agent-b".to_string()]));
        let toolset = ToolSet {
            tools: vec![handoff],
        };
        let actions = ActionSet::plan(
            vec![ToolCall::new(
                "c1",
                "handoff",
                "{\"to\": \"agent-b\", \"message\": \"billing question\"}",
            )],
            &toolset,
        );

        ToolDispatcher::new(&hooks, "t1", "agent-a", &context)
            .dispatch(actions)
            .await
            .expect("dispatch");

        let end = hooks
            .snapshot()
            .into_iter()
            .find_map(|event| match event.kind {
                HookEventKind::ToolCallEnd { result, .. } => result,
                _ => None,
            })
            .expect("tool.call.end result");
        let payload = extract_handoff(&end).expect("handoff payload");
        assert_eq!(payload.from, "agent-a");
        assert_eq!(payload.to, "agent-b");
        assert_eq!(payload.message, "billing question");
    }
}
