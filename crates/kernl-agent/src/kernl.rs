use crate::{
    Agent, AgentRegistry, HandoffPayload, HookBus, HookEvent, KernlConfig, KernlError,
    RunOptions, Thread, ThreadExecuteResult, ThreadInput, handoffs_in_history,
};
use kernl_llm::ModelRegistry;
use kernl_threadstore::{HistoryQuery, ThreadStore, Timestamp, now_millis};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// A thread currently executing under a [`Kernl`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveThread {
    pub tid: String,
    pub agent_id: String,
    pub started_at: Timestamp,
}

type ActiveTable = Arc<Mutex<HashMap<String, ActiveThread>>>;

/// Removes the active-table entry however the execution ends.
struct ActiveEntry {
    table: ActiveTable,
    tid: String,
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tid);
    }
}

/// The runtime: agent and model registries, the thread store, the table of
/// in-flight threads, and a hook bus that re-emits every registered agent's
/// events.
#[derive(Clone)]
pub struct Kernl {
    config: KernlConfig,
    agents: AgentRegistry,
    models: ModelRegistry,
    store: Arc<dyn ThreadStore>,
    active: ActiveTable,
    hooks: HookBus,
}

impl Kernl {
    pub fn new(store: Arc<dyn ThreadStore>) -> Self {
        Self::with_config(store, KernlConfig::default())
    }

    pub fn with_config(store: Arc<dyn ThreadStore>, config: KernlConfig) -> Self {
        let hooks = HookBus::with_capacity(config.hook_channel_capacity);
        Self {
            config,
            agents: AgentRegistry::new(),
            models: ModelRegistry::default(),
            store,
            active: Arc::new(Mutex::new(HashMap::new())),
            hooks,
        }
    }

    /// Makes the agent a handoff target, records its model, and forwards its
    /// hooks. Re-registering an id replaces the agent.
    pub fn register(&self, agent: Arc<Agent>) -> Result<(), KernlError> {
        self.models.register(agent.model().clone())?;
        agent.hooks().forward_to(&self.hooks);
        if let Some(previous) = self.agents.register(agent.clone())? {
            debug!(agent = %previous.id(), "replaced registered agent");
        }
        debug!(agent = %agent.id(), model = %agent.model_ref(), "registered agent");
        Ok(())
    }

    pub fn config(&self) -> &KernlConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn threads(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    pub fn hooks(&self) -> &HookBus {
        &self.hooks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HookEvent> {
        self.hooks.subscribe()
    }

    /// A new, unstarted thread for a registered agent.
    pub fn thread(&self, agent_id: &str) -> Result<Thread, KernlError> {
        let agent = self.agents.get(agent_id).ok_or_else(|| {
            KernlError::misconfiguration(format!("agent '{agent_id}' is not registered"))
        })?;
        Ok(Thread::new(agent, self.agents.clone(), self.store.clone())
            .with_config(self.config.clone()))
    }

    /// Executes `thread` while tracking it as active.
    pub async fn spawn(
        &self,
        thread: &mut Thread,
        input: impl Into<ThreadInput>,
        options: RunOptions,
    ) -> Result<ThreadExecuteResult, KernlError> {
        self.execute_tracked(thread, input.into(), options).await
    }

    /// Same as [`Kernl::spawn`].
    pub async fn schedule(
        &self,
        thread: &mut Thread,
        input: impl Into<ThreadInput>,
        options: RunOptions,
    ) -> Result<ThreadExecuteResult, KernlError> {
        self.execute_tracked(thread, input.into(), options).await
    }

    /// Creates (or, with `options.thread_id`, resumes) a thread for the
    /// agent and executes it.
    pub async fn run(
        &self,
        agent_id: &str,
        input: impl Into<ThreadInput>,
        options: RunOptions,
    ) -> Result<ThreadExecuteResult, KernlError> {
        let mut thread = self.thread(agent_id)?;
        self.execute_tracked(&mut thread, input.into(), options).await
    }

    pub fn active_threads(&self) -> Vec<ActiveThread> {
        let mut active: Vec<ActiveThread> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.tid.cmp(&b.tid)));
        active
    }

    /// Handoffs recorded in a thread's log, oldest first.
    pub async fn handoffs(&self, tid: &str) -> Result<Vec<HandoffPayload>, KernlError> {
        let history = self.store.history(tid, HistoryQuery::ascending()).await?;
        Ok(handoffs_in_history(&history))
    }

    async fn execute_tracked(
        &self,
        thread: &mut Thread,
        input: ThreadInput,
        options: RunOptions,
    ) -> Result<ThreadExecuteResult, KernlError> {
        self.models.register(thread.agent().model().clone())?;
        let tid = options
            .thread_id
            .clone()
            .unwrap_or_else(|| thread.tid().to_string());
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                tid.clone(),
                ActiveThread {
                    tid: tid.clone(),
                    agent_id: thread.agent().id().to_string(),
                    started_at: now_millis(),
                },
            );
        let _entry = ActiveEntry {
            table: self.active.clone(),
            tid,
        };
        thread.execute(input, options).await
    }
}
