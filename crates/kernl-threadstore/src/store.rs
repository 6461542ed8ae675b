use crate::types::{
    GetThreadOptions, HistoryQuery, NewThread, StoredThread, ThreadEvent, ThreadListQuery,
    ThreadPatch, ThreadRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sequence conflict for thread {tid}: expected seq {expected}, got {actual}")]
    SequenceConflict {
        tid: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable home of thread records and their event logs.
///
/// Implementations serialize concurrent appends for one tid and reject any
/// batch whose sequence numbers do not continue the log without gaps.
#[async_trait::async_trait]
pub trait ThreadStore: Send + Sync {
    /// Creates a record in the stopped state with tick 0.
    async fn insert(&self, thread: NewThread) -> StoreResult<ThreadRecord>;

    async fn get(&self, tid: &str, options: GetThreadOptions)
    -> StoreResult<Option<StoredThread>>;

    /// Appends a batch atomically. Either every event lands, in order, or
    /// none does.
    async fn append(&self, events: Vec<ThreadEvent>) -> StoreResult<()>;

    async fn history(&self, tid: &str, query: HistoryQuery) -> StoreResult<Vec<ThreadEvent>>;

    async fn list(&self, query: ThreadListQuery) -> StoreResult<Vec<ThreadRecord>>;

    /// Rejects a context change while the thread is running, unless the same
    /// patch stops it.
    async fn update(&self, tid: &str, patch: ThreadPatch) -> StoreResult<ThreadRecord>;

    async fn delete(&self, tid: &str) -> StoreResult<()>;
}
