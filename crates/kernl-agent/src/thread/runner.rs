use super::Thread;
use super::codec::{ResponseItems, new_event, split_response, unresolved_approvals};
use super::types::{
    ApprovalDecision, RunOptions, StreamEvent, StreamItem, ThreadExecuteResult, ThreadInput,
    ThreadOutput,
};
use crate::guardrails::{GuardrailContext, run_input_guardrails, run_output_guardrails};
use crate::handoff::{HandoffChain, HandoffPayload, HandoffRecord, HandoffTool};
use crate::schema::validate_against_schema;
use crate::tools::{ActionSet, DispatchReport, HandoffRequest, Tool, ToolDispatcher, ToolOutcome};
use crate::{
    HookEmitter, HookEvent, HookEventKind, KernlError, OutputType, ThreadContext, ThreadOutcome,
};
use kernl_llm::{FinishReason, Item, ModelRequest, ToolCall, ToolResult, Usage};
use kernl_threadstore::{
    GetThreadOptions, HistoryQuery, NewThread, ThreadEvent, ThreadPatch, ThreadState, now_millis,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{Instrument, debug, info, info_span, warn};

type Sink<'a> = Option<&'a UnboundedSender<StreamItem>>;

enum Completion {
    Finished(ThreadOutput),
    Interrupted(Vec<ToolCall>),
}

/// Bookkeeping for one call to `execute`.
struct Execution {
    chain: HandoffChain,
    usage: Usage,
}

impl Thread {
    pub(super) async fn run(
        &mut self,
        input: ThreadInput,
        options: RunOptions,
        sink: Sink<'_>,
    ) -> Result<ThreadExecuteResult, KernlError> {
        self.open(&options).await?;
        let span = info_span!("thread.execute", tid = %self.tid, agent = %self.agent.id());
        let result = self.drive(input, options, sink).instrument(span).await;
        self.abort.reset();
        result
    }

    /// Binds this thread to its stored record, creating the record on first
    /// use. A stored thread is rehydrated with its agent, context, tick and
    /// full history.
    async fn open(&mut self, options: &RunOptions) -> Result<(), KernlError> {
        if let Some(tid) = &options.thread_id {
            let query = GetThreadOptions {
                history: Some(HistoryQuery::ascending()),
            };
            if let Some(stored) = self.store.get(tid, query).await? {
                let record = stored.record;
                let agent = self
                    .agents
                    .get(&record.agent_id)
                    .or_else(|| (self.agent.id() == record.agent_id).then(|| self.agent.clone()))
                    .ok_or_else(|| {
                        KernlError::misconfiguration(format!(
                            "thread {} is bound to unregistered agent '{}'",
                            record.tid, record.agent_id
                        ))
                    })?;
                debug!(tid = %record.tid, events = stored.history.len(), "resuming thread");
                self.tid = record.tid;
                self.agent = agent;
                self.context = ThreadContext::new(record.context);
                self.tick = record.tick;
                self.state = record.state;
                self.history = stored.history;
                self.persisted = true;
                return Ok(());
            }
            if *tid != self.tid {
                self.tid = tid.clone();
                self.persisted = false;
                self.history.clear();
                self.tick = 0;
            }
        }
        if self.persisted {
            return Ok(());
        }

        let context = match &options.context {
            Some(context) => {
                self.context.replace(context.clone());
                context.clone()
            }
            None => self.context.snapshot(),
        };
        self.store
            .insert(NewThread {
                tid: self.tid.clone(),
                namespace: options
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.config.default_namespace.clone()),
                agent_id: self.agent.id().to_string(),
                model: self.agent.model_ref(),
                context,
                parent_task_id: options.parent_task_id.clone(),
                metadata: options.metadata.clone(),
            })
            .await?;
        self.persisted = true;
        Ok(())
    }

    async fn drive(
        &mut self,
        input: ThreadInput,
        options: RunOptions,
        sink: Sink<'_>,
    ) -> Result<ThreadExecuteResult, KernlError> {
        let mut execution = Execution {
            chain: HandoffChain::new(options.max_handoffs.or(self.config.max_handoffs)),
            usage: Usage::default(),
        };
        self.store
            .update(
                &self.tid,
                ThreadPatch {
                    state: Some(ThreadState::Running),
                    ..ThreadPatch::default()
                },
            )
            .await?;
        self.state = ThreadState::Running;
        info!(tick = self.tick, "thread started");

        match self.advance(input, &options, &mut execution, sink).await {
            Ok(completion) => self.complete(completion, execution).await,
            Err(error) => Err(self.fail(error).await),
        }
    }

    async fn advance(
        &mut self,
        input: ThreadInput,
        options: &RunOptions,
        execution: &mut Execution,
        sink: Sink<'_>,
    ) -> Result<Completion, KernlError> {
        let pending = self.settle_approvals(options, execution, sink).await?;
        if !pending.is_empty() {
            self.emit(HookEventKind::ThreadStart)?;
            return Ok(Completion::Interrupted(pending));
        }

        let input = input.into_items();
        self.append(input.clone(), sink).await?;
        self.emit(HookEventKind::ThreadStart)?;
        if !input.is_empty() && !self.agent.input_guardrails().is_empty() {
            run_input_guardrails(
                self.agent.input_guardrails(),
                &self.guardrail_context(),
                &input,
            )
            .await?;
        }

        loop {
            if self.abort.is_abort_requested() {
                return Err(KernlError::Aborted(self.tid.clone()));
            }
            if let Some(completion) = self.tick_once(execution, sink).await? {
                return Ok(completion);
            }
        }
    }

    /// One model call and everything it causes. Returns `None` when the
    /// thread should keep ticking.
    async fn tick_once(
        &mut self,
        execution: &mut Execution,
        sink: Sink<'_>,
    ) -> Result<Option<Completion>, KernlError> {
        let agent = self.agent.clone();
        let context = self.context.snapshot();
        let tools = agent.tools(self.system_tools(), &context).await?;
        let request = ModelRequest {
            history: self.history.iter().map(|event| event.item.clone()).collect(),
            instructions: agent.instructions().resolve(&context),
            tools: tools.definitions(),
            settings: agent.model_settings().clone(),
            output_schema: agent.output().schema().cloned(),
        };

        self.emit(HookEventKind::ModelCallStart {
            provider: agent.model().provider().to_string(),
            model_id: agent.model().model_id().to_string(),
        })?;
        debug!(tick = self.tick, agent = %agent.id(), tools = tools.len(), "calling model");
        let abort = self.abort.clone();
        let response = tokio::select! {
            response = agent.model().generate(request) => Some(response),
            _ = abort.requested() => None,
        };
        let response = match response {
            Some(Ok(response)) => response,
            Some(Err(error)) => {
                self.emit_model_failure();
                return Err(error.into());
            }
            None => {
                self.emit_model_failure();
                return Err(KernlError::Aborted(self.tid.clone()));
            }
        };
        self.emit(HookEventKind::ModelCallEnd {
            finish_reason: response.finish_reason,
            usage: response.usage.clone(),
        })?;
        execution.usage = std::mem::take(&mut execution.usage) + response.usage;

        let split = split_response(response.content);
        let text = split.text();
        let ResponseItems {
            message,
            other,
            tool_calls,
        } = split;
        let actions = ActionSet::plan(tool_calls, &tools);

        let mut items: Vec<Item> = message.into_iter().map(Item::Message).collect();
        items.extend(other);
        items.extend(actions.tool_calls().into_iter().map(Item::ToolCall));
        self.append(items, sink).await?;
        self.tick += 1;

        if actions.is_empty() {
            let output = self.parse_output(&text)?;
            if !agent.output_guardrails().is_empty() {
                run_output_guardrails(
                    agent.output_guardrails(),
                    &self.guardrail_context(),
                    &output.to_value(),
                )
                .await?;
            }
            return Ok(Some(Completion::Finished(output)));
        }

        let report = self.dispatch(actions).await?;
        let pending = report.pending_approvals.clone();
        self.record_results(report, execution, sink).await?;
        self.store
            .update(
                &self.tid,
                ThreadPatch {
                    tick: Some(self.tick),
                    agent_id: Some(self.agent.id().to_string()),
                    model: Some(self.agent.model_ref()),
                    ..ThreadPatch::default()
                },
            )
            .await?;

        if pending.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Completion::Interrupted(pending)))
        }
    }

    /// Runs or denies calls the caller decided on. Returns the calls that
    /// still wait for a decision.
    async fn settle_approvals(
        &mut self,
        options: &RunOptions,
        execution: &mut Execution,
        sink: Sink<'_>,
    ) -> Result<Vec<ToolCall>, KernlError> {
        let unresolved = unresolved_approvals(&self.history);
        if unresolved.is_empty() {
            return Ok(Vec::new());
        }

        let mut approved = Vec::new();
        let mut denied = Vec::new();
        let mut pending = Vec::new();
        for call in unresolved {
            match options.approvals.get(&call.call_id) {
                Some(ApprovalDecision::Approve) => approved.push(call),
                Some(ApprovalDecision::Deny) => denied.push(call),
                None => pending.push(call),
            }
        }
        debug!(
            approved = approved.len(),
            denied = denied.len(),
            pending = pending.len(),
            "settling approvals"
        );

        if !approved.is_empty() || !denied.is_empty() {
            let tools = self
                .agent
                .tools(self.system_tools(), &self.context.snapshot())
                .await?;
            let mut actions = ActionSet::approved(approved, &tools);
            actions.extend(ActionSet::denied(denied));
            let report = self.dispatch(actions).await?;
            self.record_results(report, execution, sink).await?;
        }
        Ok(pending)
    }

    /// An abort while tools run leaves their calls without results.
    async fn dispatch(&self, actions: ActionSet) -> Result<DispatchReport, KernlError> {
        let agent = self.agent.clone();
        let dispatcher = ToolDispatcher::new(agent.hooks(), &self.tid, agent.id(), &self.context);
        tokio::select! {
            report = dispatcher.dispatch(actions) => report,
            _ = self.abort.requested() => {
                warn!(tid = %self.tid, "tool dispatch aborted");
                Err(KernlError::Aborted(self.tid.clone()))
            }
        }
    }

    /// Appends one result per dispatched call. Handoffs are applied in call
    /// order; the last one leaves its target in control.
    async fn record_results(
        &mut self,
        report: DispatchReport,
        execution: &mut Execution,
        sink: Sink<'_>,
    ) -> Result<(), KernlError> {
        let mut items = Vec::with_capacity(report.results.len());
        for dispatched in report.results {
            let call = dispatched.call;
            let result = match dispatched.outcome {
                ToolOutcome::Completed(value) => {
                    ToolResult::completed(call.call_id, call.tool_id, value)
                }
                ToolOutcome::Failed(error) => ToolResult::failed(call.call_id, call.tool_id, error),
                ToolOutcome::Handoff(request) => {
                    let record = self.hand_off(request, execution, sink)?;
                    ToolResult::completed(
                        call.call_id,
                        call.tool_id,
                        HandoffPayload::from(&record).to_value(),
                    )
                }
            };
            items.push(Item::ToolResult(result));
        }
        self.append(items, sink).await
    }

    fn hand_off(
        &mut self,
        request: HandoffRequest,
        execution: &mut Execution,
        sink: Sink<'_>,
    ) -> Result<HandoffRecord, KernlError> {
        let target = self.agents.get(&request.to).ok_or_else(|| {
            KernlError::HandoffTargetNotFound {
                target: request.to.clone(),
                available: self.agents.ids(),
            }
        })?;
        let record = HandoffRecord {
            from: self.agent.id().to_string(),
            to: target.id().to_string(),
            message: request.message,
            timestamp: now_millis(),
        };
        execution.chain.push(record.clone())?;

        self.emit(HookEventKind::AgentHandoff {
            from: record.from.clone(),
            to: record.to.clone(),
            message: record.message.clone(),
        })?;
        info!(from = %record.from, to = %record.to, "agent handoff");
        self.agent = target;
        send(sink, StreamEvent::Handoff(record.clone()));
        Ok(record)
    }

    fn system_tools(&self) -> Vec<Arc<dyn Tool>> {
        let targets = self
            .agents
            .ids()
            .into_iter()
            .filter(|id| id != self.agent.id())
            .collect();
        let handoff: Arc<dyn Tool> = Arc::new(HandoffTool::new(targets));
        vec![handoff]
    }

    fn parse_output(&self, text: &str) -> Result<ThreadOutput, KernlError> {
        let OutputType::Structured { schema } = self.agent.output() else {
            return Ok(ThreadOutput::Text(text.to_string()));
        };
        let value: Value = serde_json::from_str(strip_code_fence(text)).map_err(|error| {
            KernlError::OutputParse(format!("final response is not valid JSON: {error}"))
        })?;
        validate_against_schema(schema, &value).map_err(KernlError::OutputParse)?;
        Ok(ThreadOutput::Structured(value))
    }

    async fn complete(
        &mut self,
        completion: Completion,
        execution: Execution,
    ) -> Result<ThreadExecuteResult, KernlError> {
        if let Err(error) = self.stop().await {
            return Err(self.fail(error).await);
        }
        let (outcome, response, pending_approvals) = match completion {
            Completion::Finished(output) => (ThreadOutcome::Success, Some(output), Vec::new()),
            Completion::Interrupted(pending) => (ThreadOutcome::Interrupted, None, pending),
        };
        self.emit(HookEventKind::ThreadStop {
            outcome,
            result: response.as_ref().map(ThreadOutput::to_value),
            error: None,
        })?;
        info!(
            ?outcome,
            tick = self.tick,
            agent = %self.agent.id(),
            handoffs = execution.chain.len(),
            "thread stopped"
        );

        Ok(ThreadExecuteResult {
            tid: self.tid.clone(),
            response,
            outcome,
            state: self.state,
            final_agent: self.agent.id().to_string(),
            handoff_chain: execution.chain.into_records(),
            usage: execution.usage,
            pending_approvals,
        })
    }

    /// Leaves the thread stopped and reports the error. Cleanup failures are
    /// logged; the original error is returned.
    async fn fail(&mut self, error: KernlError) -> KernlError {
        warn!(error = %error, tick = self.tick, "thread stopped with error");
        if let Err(stop_error) = self.stop().await {
            warn!(error = %stop_error, "marking thread stopped failed");
        }
        if let Err(hook_error) = self.emit(HookEventKind::ThreadStop {
            outcome: ThreadOutcome::Error,
            result: None,
            error: Some(error.to_string()),
        }) {
            warn!(error = %hook_error, "thread.stop hook failed");
        }
        error
    }

    async fn stop(&mut self) -> Result<(), KernlError> {
        self.state = ThreadState::Stopped;
        self.store
            .update(
                &self.tid,
                ThreadPatch {
                    state: Some(ThreadState::Stopped),
                    context: Some(self.context.snapshot()),
                    tick: Some(self.tick),
                    agent_id: Some(self.agent.id().to_string()),
                    model: Some(self.agent.model_ref()),
                    ..ThreadPatch::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Persists `items` as one batch continuing the log, then mirrors them
    /// in memory and on the stream.
    async fn append(&mut self, items: Vec<Item>, sink: Sink<'_>) -> Result<(), KernlError> {
        if items.is_empty() {
            return Ok(());
        }
        let start = self.next_seq();
        let events: Vec<ThreadEvent> = items
            .into_iter()
            .zip(start..)
            .map(|(item, seq)| new_event(&self.tid, seq, item))
            .collect();
        self.store.append(events.clone()).await?;
        for event in events {
            send(sink, StreamEvent::Event(event.clone()));
            self.history.push(event);
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.history.last().map(|event| event.seq + 1).unwrap_or(0)
    }

    fn guardrail_context(&self) -> GuardrailContext {
        GuardrailContext {
            thread_id: self.tid.clone(),
            agent_id: self.agent.id().to_string(),
            context: self.context.snapshot(),
        }
    }

    fn emit(&self, kind: HookEventKind) -> Result<(), KernlError> {
        self.agent.hooks().emit(HookEvent::new(
            self.tid.clone(),
            self.agent.id(),
            self.context.snapshot(),
            kind,
        ))
    }

    /// The model failure is what the caller sees; a hook error here is only
    /// logged.
    fn emit_model_failure(&self) {
        if let Err(hook_error) = self.emit(HookEventKind::ModelCallEnd {
            finish_reason: FinishReason::Error,
            usage: Usage::default(),
        }) {
            warn!(error = %hook_error, "model.call.end hook failed");
        }
    }
}

fn send(sink: Sink<'_>, event: StreamEvent) {
    if let Some(sender) = sink {
        // The consumer may have dropped the stream; the execution continues.
        let _ = sender.send(Ok(event));
    }
}

/// Accepts JSON wrapped in a markdown code fence, with or without a
/// language tag.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    match rest.split_once('\n') {
        Some((tag, body)) if !tag.trim_start().starts_with(['{', '[']) => body.trim(),
        _ => rest.trim(),
    }
}
