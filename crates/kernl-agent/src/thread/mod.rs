//! A thread: one conversation driven by an agent over an append-only log.

mod codec;
mod runner;
mod types;


use crate::{Agent, AgentRegistry, KernlConfig, KernlError, ThreadContext};
use futures::Stream;
use kernl_threadstore::{ThreadEvent, ThreadState, ThreadStore};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

pub use types::{
    ApprovalDecision, RunOptions, StreamEvent, ThreadExecuteResult, ThreadInput, ThreadOutput,
};

use types::StreamItem;

/// Requests cooperative cancellation of a running thread. A pending model
/// call or tool fan-out is dropped; otherwise the thread stops at the next
/// tick boundary. Either way it fails with [`KernlError::Aborted`].
#[derive(Clone, Debug)]
pub struct ThreadAbortHandle {
    abort_requested: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
}

impl ThreadAbortHandle {
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Resolves once an abort has been requested.
    pub(crate) async fn requested(&self) {
        loop {
            let notified = self.abort_notify.notified();
            if self.is_abort_requested() {
                return;
            }
            notified.await;
        }
    }

    fn reset(&self) {
        self.abort_requested.store(false, Ordering::SeqCst);
    }
}

impl Default for ThreadAbortHandle {
    fn default() -> Self {
        Self {
            abort_requested: Arc::new(AtomicBool::new(false)),
            abort_notify: Arc::new(Notify::new()),
        }
    }
}

pub struct Thread {
    tid: String,
    agent: Arc<Agent>,
    agents: AgentRegistry,
    store: Arc<dyn ThreadStore>,
    config: KernlConfig,
    /// Whether the record for `tid` exists in the store.
    persisted: bool,
    history: Vec<ThreadEvent>,
    context: ThreadContext,
    tick: u64,
    state: ThreadState,
    abort: ThreadAbortHandle,
}

impl Thread {
    /// A fresh thread with a generated id. Nothing is written to the store
    /// until the first execution.
    pub fn new(agent: Arc<Agent>, agents: AgentRegistry, store: Arc<dyn ThreadStore>) -> Self {
        Self {
            tid: uuid::Uuid::new_v4().to_string(),
            agent,
            agents,
            store,
            config: KernlConfig::default(),
            persisted: false,
            history: Vec::new(),
            context: ThreadContext::new(serde_json::json!({})),
            tick: 0,
            state: ThreadState::Stopped,
            abort: ThreadAbortHandle::default(),
        }
    }

    pub fn with_config(mut self, config: KernlConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial context for a thread that is not in the store yet.
    /// `RunOptions::context` takes precedence.
    pub fn with_context(self, context: serde_json::Value) -> Self {
        self.context.replace(context);
        self
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// The agent currently in control; changes on handoff.
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn history(&self) -> &[ThreadEvent] {
        &self.history
    }

    pub fn context(&self) -> &ThreadContext {
        &self.context
    }

    pub fn abort_handle(&self) -> ThreadAbortHandle {
        self.abort.clone()
    }

    /// Runs ticks until the agent produces a final response, a call awaits
    /// approval, or an error stops the thread.
    pub async fn execute(
        &mut self,
        input: impl Into<ThreadInput>,
        options: RunOptions,
    ) -> Result<ThreadExecuteResult, KernlError> {
        self.run(input.into(), options, None).await
    }

    /// Like [`Thread::execute`], on a background task. Events are yielded as
    /// they are appended; the last item is either `StreamEvent::Finish` or
    /// the error that stopped the thread.
    pub fn stream(self, input: impl Into<ThreadInput>, options: RunOptions) -> ThreadStream {
        let input = input.into();
        let abort = self.abort_handle();
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut thread = self;
            let item = match thread.run(input, options, Some(&sender)).await {
                Ok(result) => Ok(StreamEvent::Finish(result)),
                Err(error) => Err(error),
            };
            let _ = sender.send(item);
            thread
        });
        ThreadStream {
            receiver,
            task,
            abort,
        }
    }
}

/// Items of a streamed execution. Dropping the stream does not cancel the
/// execution; use [`ThreadStream::abort_handle`] for that.
pub struct ThreadStream {
    receiver: mpsc::UnboundedReceiver<StreamItem>,
    task: JoinHandle<Thread>,
    abort: ThreadAbortHandle,
}

impl ThreadStream {
    pub fn abort_handle(&self) -> ThreadAbortHandle {
        self.abort.clone()
    }

    /// Waits for the background execution and hands the thread back.
    pub async fn into_thread(self) -> Result<Thread, KernlError> {
        self.task
            .await
            .map_err(|error| KernlError::Task(error.to_string()))
    }
}

impl Stream for ThreadStream {
    type Item = Result<StreamEvent, KernlError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
