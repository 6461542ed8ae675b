use kernl_llm::{Item, ItemKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Running,
    #[default]
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub tid: String,
    pub namespace: String,
    pub agent_id: String,
    /// `provider/modelId` of the active agent's model.
    pub model: String,
    pub context: Value,
    pub tick: u64,
    pub state: ThreadState,
    pub parent_task_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewThread {
    pub tid: String,
    pub namespace: String,
    pub agent_id: String,
    pub model: String,
    pub context: Value,
    pub parent_task_id: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Partial update applied by `ThreadStore::update`. `None` leaves a field
/// untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadPatch {
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub context: Option<Value>,
    pub tick: Option<u64>,
    pub state: Option<ThreadState>,
    pub metadata: Option<Map<String, Value>>,
}

/// An entry of a thread's event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadEvent {
    pub id: String,
    pub tid: String,
    pub seq: u64,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub item: Item,
}

impl ThreadEvent {
    pub fn kind(&self) -> ItemKind {
        self.item.kind()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryQuery {
    /// Only events with `seq` strictly greater than this value.
    pub after: Option<u64>,
    pub limit: Option<usize>,
    /// Defaults to latest first.
    pub order: SortOrder,
    /// Only events of these kinds. `None` returns every kind.
    pub kinds: Option<Vec<ItemKind>>,
}

impl HistoryQuery {
    pub fn ascending() -> Self {
        Self {
            order: SortOrder::Asc,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetThreadOptions {
    /// When set, the matching history is loaded alongside the record.
    pub history: Option<HistoryQuery>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredThread {
    pub record: ThreadRecord,
    pub history: Vec<ThreadEvent>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadFilter {
    pub namespace: Option<String>,
    pub agent_id: Option<String>,
    pub state: Option<ThreadState>,
    pub parent_task_id: Option<String>,
}

impl ThreadFilter {
    pub fn matches(&self, record: &ThreadRecord) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|namespace| record.namespace == namespace)
            && self
                .agent_id
                .as_deref()
                .is_none_or(|agent_id| record.agent_id == agent_id)
            && self.state.is_none_or(|state| record.state == state)
            && self
                .parent_task_id
                .as_deref()
                .is_none_or(|parent| record.parent_task_id.as_deref() == Some(parent))
    }
}

/// Threads are ordered by `created_at`, ties broken by `tid`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadListQuery {
    pub filter: ThreadFilter,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}
