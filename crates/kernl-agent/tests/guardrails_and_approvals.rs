mod support;

use kernl_agent::{
    Agent, FnInputGuardrail, FnOutputGuardrail, FunctionTool, GuardrailPhase, GuardrailResult,
    KernlError, RunOptions, StaticToolkit, ThreadOutcome, ThreadOutput, Tool,
};
use kernl_llm::{Item, Message, ToolCallState};
use kernl_threadstore::{HistoryQuery, ThreadState, ThreadStore};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use support::{SequenceModel, memory_store, text_response, thread_for, tool_call_response};

fn blocks_secrets() -> Arc<FnInputGuardrail> {
    Arc::new(FnInputGuardrail::new("secrets", |_context, input| {
        let leaked = input
            .iter()
            .filter_map(Item::as_message)
            .any(|message| message.text().contains("password"));
        if leaked {
            GuardrailResult::tripwire(json!({"reason": "password in input"}))
        } else {
            GuardrailResult::pass()
        }
    }))
}

#[tokio::test(flavor = "current_thread")]
async fn input_tripwire_stops_before_any_model_call() {
    let model = SequenceModel::new("m");
    model.enqueue(text_response("should not be generated"));
    let agent = Arc::new(
        Agent::builder("agent-a", "A")
            .model(Arc::new(model.clone()))
            .input_guardrail(blocks_secrets())
            .build()
            .expect("agent should build"),
    );
    let store = memory_store();
    let mut thread = thread_for(agent, store.clone());

    let error = thread
        .execute("my password is hunter2", RunOptions::default())
        .await
        .expect_err("tripwire should fail");

    match error {
        KernlError::GuardrailTripwire {
            phase,
            guardrail,
            output_info,
        } => {
            assert_eq!(phase, GuardrailPhase::Input);
            assert_eq!(guardrail, "secrets");
            assert_eq!(output_info["reason"], "password in input");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(model.requests().is_empty());
    assert_eq!(thread.state(), ThreadState::Stopped);
}

#[tokio::test(flavor = "current_thread")]
async fn input_guardrails_only_see_new_input_on_resume() {
    let checks = Arc::new(AtomicUsize::new(0));
    let counted = checks.clone();
    let model = SequenceModel::new("m");
    model
        .enqueue(tool_call_response(vec![("call-1", "echo", json!({}))]))
        .enqueue(text_response("first"))
        .enqueue(text_response("second"));
    let echo: Arc<dyn Tool> = Arc::new(FunctionTool::new(
        "echo",
        "echo",
        json!({"type": "object"}),
        |_context, arguments| async move { Ok(arguments) },
    ));
    let agent = Arc::new(
        Agent::builder("agent-a", "A")
            .model(Arc::new(model))
            .toolkit(Arc::new(StaticToolkit::new("kit", vec![echo])))
            .input_guardrail(Arc::new(FnInputGuardrail::new("count", move |_, input| {
                counted.fetch_add(input.len(), Ordering::SeqCst);
                GuardrailResult::pass()
            })))
            .build()
            .expect("agent should build"),
    );
    let mut thread = thread_for(agent, memory_store());

    thread
        .execute("one", RunOptions::default())
        .await
        .expect("first execute");
    assert_eq!(checks.load(Ordering::SeqCst), 1);

    thread
        .execute("two", RunOptions::default())
        .await
        .expect("second execute");
    assert_eq!(checks.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn output_tripwire_rejects_final_response() {
    let model = SequenceModel::new("m");
    model.enqueue(text_response("I cannot help with refunds"));
    let agent = Arc::new(
        Agent::builder("agent-a", "A")
            .model(Arc::new(model))
            .output_guardrail(Arc::new(FnOutputGuardrail::new("no-refusals", |_, output| {
                if output.as_str().is_some_and(|text| text.contains("cannot")) {
                    GuardrailResult::tripwire(json!({"matched": "cannot"}))
                } else {
                    GuardrailResult::pass()
                }
            })))
            .build()
            .expect("agent should build"),
    );
    let store = memory_store();
    let mut thread = thread_for(agent, store.clone());

    let error = thread
        .execute("refund please", RunOptions::default())
        .await
        .expect_err("output tripwire should fail");
    assert!(matches!(
        error,
        KernlError::GuardrailTripwire {
            phase: GuardrailPhase::Output,
            ..
        }
    ));

    // The rejected message was already recorded before the guardrail ran.
    let history = store
        .history(thread.tid(), HistoryQuery::ascending())
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
}

fn transfer_agent(model: &SequenceModel, runs: Arc<AtomicUsize>) -> Arc<Agent> {
    let transfer: Arc<dyn Tool> = Arc::new(
        FunctionTool::new(
            "transfer",
            "Move money between accounts",
            json!({
                "type": "object",
                "required": ["amount"],
                "properties": {"amount": {"type": "integer"}}
            }),
            move |_context, arguments| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"moved": arguments["amount"]}))
                }
            },
        )
        .requiring_approval(),
    );
    Arc::new(
        Agent::builder("banker", "Banker")
            .model(Arc::new(model.clone()))
            .toolkit(Arc::new(StaticToolkit::new("bank", vec![transfer])))
            .build()
            .expect("agent should build"),
    )
}

#[tokio::test(flavor = "current_thread")]
async fn approval_gated_call_interrupts_then_runs_once_approved() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = SequenceModel::new("m");
    model
        .enqueue(tool_call_response(vec![(
            "call-1",
            "transfer",
            json!({"amount": 50}),
        )]))
        .enqueue(text_response("Transferred 50"));
    let store = memory_store();
    let mut thread = thread_for(transfer_agent(&model, runs.clone()), store.clone());

    let interrupted = thread
        .execute("send 50", RunOptions::default())
        .await
        .expect("execute should interrupt");
    assert_eq!(interrupted.outcome, ThreadOutcome::Interrupted);
    assert_eq!(interrupted.response, None);
    assert_eq!(interrupted.state, ThreadState::Stopped);
    assert_eq!(interrupted.pending_approvals.len(), 1);
    assert_eq!(
        interrupted.pending_approvals[0].state,
        ToolCallState::RequiresApproval
    );
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Resuming without a decision stays interrupted and records nothing.
    let still_pending = thread
        .execute(Vec::<Item>::new(), RunOptions::resume(interrupted.tid.clone()))
        .await
        .expect("execute without decision");
    assert_eq!(still_pending.outcome, ThreadOutcome::Interrupted);

    let finished = thread
        .execute(
            Vec::<Item>::new(),
            RunOptions::resume(interrupted.tid.clone()).approve("call-1"),
        )
        .await
        .expect("approved execute");
    assert_eq!(finished.outcome, ThreadOutcome::Success);
    assert_eq!(
        finished.response,
        Some(ThreadOutput::Text("Transferred 50".to_string()))
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let history = store
        .history(&interrupted.tid, HistoryQuery::ascending())
        .await
        .expect("history");
    let result = history
        .iter()
        .find_map(|event| event.item.as_tool_result())
        .expect("tool result recorded");
    assert_eq!(result.result, Some(json!({"moved": 50})));
    let seqs: Vec<u64> = history.iter().map(|event| event.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "current_thread")]
async fn denied_call_reports_denial_to_the_model() {
    let runs = Arc::new(AtomicUsize::new(0));
    let model = SequenceModel::new("m");
    model
        .enqueue(tool_call_response(vec![(
            "call-1",
            "transfer",
            json!({"amount": 5000}),
        )]))
        .enqueue(text_response("The transfer was not approved"));
    let mut thread = thread_for(transfer_agent(&model, runs.clone()), memory_store());

    let interrupted = thread
        .execute("send 5000", RunOptions::default())
        .await
        .expect("execute should interrupt");
    let finished = thread
        .execute(
            vec![Item::Message(Message::user("no"))],
            RunOptions::resume(interrupted.tid).deny("call-1"),
        )
        .await
        .expect("denied execute");

    assert_eq!(finished.outcome, ThreadOutcome::Success);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let second_request = &model.requests()[1];
    let denial = second_request
        .history
        .iter()
        .find_map(Item::as_tool_result)
        .expect("denial recorded before new input");
    assert_eq!(denial.error.as_deref(), Some("tool call denied"));
    let last = second_request.history.last().and_then(Item::as_message);
    assert_eq!(last.map(Message::text), Some("no".to_string()));
}
