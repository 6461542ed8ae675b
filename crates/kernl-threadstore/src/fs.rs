use crate::memory::{MemoryState, MemoryThreadStore};
use crate::store::{StoreError, StoreResult, ThreadStore};
use crate::types::{
    GetThreadOptions, HistoryQuery, NewThread, StoredThread, ThreadEvent, ThreadListQuery,
    ThreadPatch, ThreadRecord,
};
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE_NAME: &str = "threadstore-state.json";

/// Single-file store. Every mutation is written to disk, through a temp
/// file and rename, before it becomes visible.
#[derive(Clone, Debug)]
pub struct FsThreadStore {
    state_file: PathBuf,
    inner: MemoryThreadStore,
}

impl FsThreadStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| StoreError::Backend(format!("create fs store root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<MemoryState>(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            MemoryState::default()
        };

        Ok(Self {
            state_file,
            inner: MemoryThreadStore::from_state(state),
        })
    }

    /// Writes `state` through a temp file and rename. Callers hold the store
    /// lock, so only one write is in flight.
    fn write_state(state_file: &Path, state: &MemoryState) -> StoreResult<()> {
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let tmp = state_file.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| StoreError::Backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, state_file)
            .map_err(|err| StoreError::Backend(format!("rename state file failed: {err}")))?;
        Ok(())
    }

    /// A mutation lands in memory only once it is on disk.
    fn commit<R>(
        &self,
        mutate: impl FnOnce(&mut MemoryState) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.inner
            .transact(mutate, |next| Self::write_state(&self.state_file, next))
    }
}

#[async_trait::async_trait]
impl ThreadStore for FsThreadStore {
    async fn insert(&self, thread: NewThread) -> StoreResult<ThreadRecord> {
        self.commit(|state| state.insert_thread(thread))
    }

    async fn get(
        &self,
        tid: &str,
        options: GetThreadOptions,
    ) -> StoreResult<Option<StoredThread>> {
        self.inner.get(tid, options).await
    }

    async fn append(&self, events: Vec<ThreadEvent>) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.commit(|state| state.append_events(events))
    }

    async fn history(&self, tid: &str, query: HistoryQuery) -> StoreResult<Vec<ThreadEvent>> {
        self.inner.history(tid, query).await
    }

    async fn list(&self, query: ThreadListQuery) -> StoreResult<Vec<ThreadRecord>> {
        self.inner.list(query).await
    }

    async fn update(&self, tid: &str, patch: ThreadPatch) -> StoreResult<ThreadRecord> {
        self.commit(|state| state.apply_patch(tid, patch))
    }

    async fn delete(&self, tid: &str) -> StoreResult<()> {
        self.commit(|state| state.remove_thread(tid))
    }
}
