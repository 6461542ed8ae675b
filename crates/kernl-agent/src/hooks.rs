use crate::KernlError;
use kernl_llm::{FinishReason, ToolCallState, Usage};
use kernl_threadstore::{Timestamp, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadOutcome {
    Success,
    Error,
    /// Stopped with tool calls awaiting approval.
    Interrupted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum HookEventKind {
    #[serde(rename = "thread.start")]
    ThreadStart,
    #[serde(rename = "thread.stop")]
    ThreadStop {
        outcome: ThreadOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "model.call.start")]
    ModelCallStart { provider: String, model_id: String },
    #[serde(rename = "model.call.end")]
    ModelCallEnd {
        finish_reason: FinishReason,
        usage: Usage,
    },
    #[serde(rename = "tool.call.start")]
    ToolCallStart {
        call_id: String,
        tool_id: String,
        arguments: Value,
    },
    #[serde(rename = "tool.call.end")]
    ToolCallEnd {
        call_id: String,
        tool_id: String,
        state: ToolCallState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "agent_handoff")]
    AgentHandoff {
        from: String,
        to: String,
        message: String,
    },
}

/// A lifecycle notification. Every event carries the thread, the agent that
/// was active when it fired, and a snapshot of the thread context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub thread_id: String,
    pub agent_id: String,
    pub context: Value,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: HookEventKind,
}

impl HookEvent {
    pub fn new(
        thread_id: impl Into<String>,
        agent_id: impl Into<String>,
        context: Value,
        kind: HookEventKind,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            agent_id: agent_id.into(),
            context,
            timestamp: now_millis(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            HookEventKind::ThreadStart => "thread.start",
            HookEventKind::ThreadStop { .. } => "thread.stop",
            HookEventKind::ModelCallStart { .. } => "model.call.start",
            HookEventKind::ModelCallEnd { .. } => "model.call.end",
            HookEventKind::ToolCallStart { .. } => "tool.call.start",
            HookEventKind::ToolCallEnd { .. } => "tool.call.end",
            HookEventKind::AgentHandoff { .. } => "agent_handoff",
        }
    }
}

/// Receives hook events synchronously. An error aborts the emitting thread.
pub trait HookEmitter: Send + Sync {
    fn emit(&self, event: HookEvent) -> Result<(), KernlError>;
}

#[derive(Default)]
pub struct NoopHookEmitter;

impl HookEmitter for NoopHookEmitter {
    fn emit(&self, _event: HookEvent) -> Result<(), KernlError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedHookEmitter {
    inner: Arc<Mutex<Vec<HookEvent>>>,
}

impl BufferedHookEmitter {
    pub fn snapshot(&self) -> Vec<HookEvent> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.snapshot().iter().map(HookEvent::name).collect()
    }
}

impl HookEmitter for BufferedHookEmitter {
    fn emit(&self, event: HookEvent) -> Result<(), KernlError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Fan-out point for hook events: synchronous listeners plus a broadcast
/// channel for async subscribers. Clones share listeners and subscribers.
#[derive(Clone)]
pub struct HookBus {
    inner: Arc<HookBusInner>,
}

struct HookBusInner {
    id: u64,
    listeners: RwLock<Vec<Arc<dyn HookEmitter>>>,
    forwarded_to: Mutex<HashSet<u64>>,
    sender: broadcast::Sender<HookEvent>,
}

impl Default for HookBus {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HookBusInner {
                id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
                listeners: RwLock::new(Vec::new()),
                forwarded_to: Mutex::new(HashSet::new()),
                sender,
            }),
        }
    }

    /// Subscribers that fall behind by more than the channel capacity see a
    /// `Lagged` error and miss the overwritten events.
    pub fn subscribe(&self) -> broadcast::Receiver<HookEvent> {
        self.inner.sender.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn HookEmitter>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Re-emits every event of this bus on `target`. Forwarding to the same
    /// target twice is a no-op.
    pub fn forward_to(&self, target: &HookBus) {
        if target.inner.id == self.inner.id {
            return;
        }
        let inserted = self
            .inner
            .forwarded_to
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target.inner.id);
        if inserted {
            self.add_listener(Arc::new(target.clone()));
        }
    }
}

impl HookEmitter for HookBus {
    fn emit(&self, event: HookEvent) -> Result<(), KernlError> {
        let listeners: Vec<Arc<dyn HookEmitter>> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // No subscribers is not an error.
        let _ = self.inner.sender.send(event.clone());
        for listener in listeners {
            listener.emit(event.clone())?;
        }
        Ok(())
    }
}
