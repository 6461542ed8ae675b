use crate::store::{StoreError, StoreResult, ThreadStore};
use crate::types::{
    GetThreadOptions, HistoryQuery, NewThread, SortOrder, StoredThread, ThreadEvent,
    ThreadListQuery, ThreadPatch, ThreadRecord, ThreadState, now_millis,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub threads: BTreeMap<String, ThreadRecord>,
    pub events: BTreeMap<String, Vec<ThreadEvent>>,
}

impl MemoryState {
    fn record(&self, tid: &str) -> StoreResult<&ThreadRecord> {
        self.threads.get(tid).ok_or_else(|| StoreError::NotFound {
            resource: "thread",
            id: tid.to_string(),
        })
    }

    fn next_seq(&self, tid: &str) -> u64 {
        self.events
            .get(tid)
            .map(|events| events.len() as u64)
            .unwrap_or(0)
    }

    fn query_history(&self, tid: &str, query: &HistoryQuery) -> Vec<ThreadEvent> {
        let Some(events) = self.events.get(tid) else {
            return Vec::new();
        };
        let matching = events.iter().filter(|event| {
            query.after.is_none_or(|after| event.seq > after)
                && query
                    .kinds
                    .as_ref()
                    .is_none_or(|kinds| kinds.contains(&event.kind()))
        });
        let limit = query.limit.unwrap_or(usize::MAX);
        match query.order {
            SortOrder::Asc => matching.take(limit).cloned().collect(),
            SortOrder::Desc => matching.rev().take(limit).cloned().collect(),
        }
    }

    /// Checks that `events` continue each tid's log without gaps.
    fn validate_batch(&self, events: &[ThreadEvent]) -> StoreResult<()> {
        let mut expected: BTreeMap<&str, u64> = BTreeMap::new();
        for event in events {
            if !expected.contains_key(event.tid.as_str()) {
                self.record(&event.tid)?;
                expected.insert(event.tid.as_str(), self.next_seq(&event.tid));
            }
            let next = expected
                .get_mut(event.tid.as_str())
                .ok_or_else(|| StoreError::Backend("sequence bookkeeping lost".to_string()))?;
            if event.seq != *next {
                return Err(StoreError::SequenceConflict {
                    tid: event.tid.clone(),
                    expected: *next,
                    actual: event.seq,
                });
            }
            *next += 1;
        }
        Ok(())
    }

    pub(crate) fn insert_thread(&mut self, thread: NewThread) -> StoreResult<ThreadRecord> {
        if thread.tid.trim().is_empty() {
            return Err(StoreError::InvalidInput("tid must not be empty".to_string()));
        }
        if self.threads.contains_key(&thread.tid) {
            return Err(StoreError::Conflict(format!(
                "thread {} already exists",
                thread.tid
            )));
        }

        let now = now_millis();
        let record = ThreadRecord {
            tid: thread.tid.clone(),
            namespace: thread.namespace,
            agent_id: thread.agent_id,
            model: thread.model,
            context: thread.context,
            tick: 0,
            state: ThreadState::Stopped,
            parent_task_id: thread.parent_task_id,
            metadata: thread.metadata,
            created_at: now,
            updated_at: now,
        };
        self.threads.insert(thread.tid.clone(), record.clone());
        self.events.insert(thread.tid, Vec::new());
        Ok(record)
    }

    /// Leaves the state untouched when the batch is rejected.
    pub(crate) fn append_events(&mut self, events: Vec<ThreadEvent>) -> StoreResult<()> {
        self.validate_batch(&events)?;
        for event in events {
            self.events.entry(event.tid.clone()).or_default().push(event);
        }
        Ok(())
    }

    pub(crate) fn apply_patch(
        &mut self,
        tid: &str,
        patch: ThreadPatch,
    ) -> StoreResult<ThreadRecord> {
        let record = self.threads.get_mut(tid).ok_or_else(|| StoreError::NotFound {
            resource: "thread",
            id: tid.to_string(),
        })?;

        let stays_running = record.state == ThreadState::Running
            && patch.state.is_none_or(|next| next == ThreadState::Running);
        if patch.context.is_some() && stays_running {
            return Err(StoreError::Conflict(format!(
                "cannot modify context of running thread {tid}"
            )));
        }

        if let Some(agent_id) = patch.agent_id {
            record.agent_id = agent_id;
        }
        if let Some(model) = patch.model {
            record.model = model;
        }
        if let Some(context) = patch.context {
            record.context = context;
        }
        if let Some(tick) = patch.tick {
            record.tick = tick;
        }
        if let Some(next_state) = patch.state {
            record.state = next_state;
        }
        if let Some(metadata) = patch.metadata {
            record.metadata = metadata;
        }
        record.updated_at = now_millis();
        Ok(record.clone())
    }

    pub(crate) fn remove_thread(&mut self, tid: &str) -> StoreResult<()> {
        if self.threads.remove(tid).is_none() {
            return Err(StoreError::NotFound {
                resource: "thread",
                id: tid.to_string(),
            });
        }
        self.events.remove(tid);
        Ok(())
    }

    pub(crate) fn list_threads(&self, query: &ThreadListQuery) -> StoreResult<Vec<ThreadRecord>> {
        let mut records: Vec<&ThreadRecord> = self
            .threads
            .values()
            .filter(|record| query.filter.matches(record))
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.tid.cmp(&b.tid))
        });
        if query.order == SortOrder::Desc {
            records.reverse();
        }
        Ok(records
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryThreadStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Applies `mutate` to a copy of the state and swaps the copy in only
    /// once `commit` accepts it. The lock is held throughout, so commits
    /// never interleave.
    pub(crate) fn transact<R>(
        &self,
        mutate: impl FnOnce(&mut MemoryState) -> StoreResult<R>,
        commit: impl FnOnce(&MemoryState) -> StoreResult<()>,
    ) -> StoreResult<R> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let output = mutate(&mut next)?;
        commit(&next)?;
        *state = next;
        Ok(output)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory threadstore mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn insert(&self, thread: NewThread) -> StoreResult<ThreadRecord> {
        self.lock()?.insert_thread(thread)
    }

    async fn get(
        &self,
        tid: &str,
        options: GetThreadOptions,
    ) -> StoreResult<Option<StoredThread>> {
        let state = self.lock()?;
        let Some(record) = state.threads.get(tid) else {
            return Ok(None);
        };
        let history = options
            .history
            .map(|query| state.query_history(tid, &query))
            .unwrap_or_default();
        Ok(Some(StoredThread {
            record: record.clone(),
            history,
        }))
    }

    async fn append(&self, events: Vec<ThreadEvent>) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.lock()?.append_events(events)
    }

    async fn history(&self, tid: &str, query: HistoryQuery) -> StoreResult<Vec<ThreadEvent>> {
        let state = self.lock()?;
        state.record(tid)?;
        Ok(state.query_history(tid, &query))
    }

    async fn list(&self, query: ThreadListQuery) -> StoreResult<Vec<ThreadRecord>> {
        self.lock()?.list_threads(&query)
    }

    async fn update(&self, tid: &str, patch: ThreadPatch) -> StoreResult<ThreadRecord> {
        self.lock()?.apply_patch(tid, patch)
    }

    async fn delete(&self, tid: &str) -> StoreResult<()> {
        self.lock()?.remove_thread(tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernl_llm::{Item, ItemKind, Message};
    use serde_json::{Map, json};

    fn new_thread(tid: &str) -> NewThread {
        NewThread {
            tid: tid.to_string(),
            namespace: "kernl".to_string(),
            agent_id: "agent-a".to_string(),
            model: "test/m".to_string(),
            context: json!({}),
            parent_task_id: None,
            metadata: Map::new(),
        }
    }

    fn event(tid: &str, seq: u64, item: Item) -> ThreadEvent {
        ThreadEvent {
            id: format!("{tid}-{seq}"),
            tid: tid.to_string(),
            seq,
            timestamp: seq,
            metadata: Map::new(),
            item,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_with_gap_is_rejected_and_nothing_lands() {
        let store = MemoryThreadStore::new();
        store.insert(new_thread("t1")).await.expect("insert");

        let error = store
            .append(vec![
                event("t1", 0, Item::Message(Message::user("a"))),
                event("t1", 2, Item::Message(Message::assistant("b"))),
            ])
            .await
            .expect_err("gap should be rejected");
        assert!(matches!(
            error,
            StoreError::SequenceConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        let history = store
            .history("t1", HistoryQuery::default())
            .await
            .expect("history");
        assert!(history.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_duplicate_seq_is_rejected() {
        let store = MemoryThreadStore::new();
        store.insert(new_thread("t1")).await.expect("insert");
        store
            .append(vec![event("t1", 0, Item::Message(Message::user("a")))])
            .await
            .expect("first append");

        let error = store
            .append(vec![event("t1", 0, Item::Message(Message::user("again")))])
            .await
            .expect_err("duplicate should be rejected");
        assert!(matches!(error, StoreError::SequenceConflict { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn history_defaults_to_latest_first_and_filters_kinds() {
        let store = MemoryThreadStore::new();
        store.insert(new_thread("t1")).await.expect("insert");
        store
            .append(vec![
                event("t1", 0, Item::Message(Message::user("a"))),
                event("t1", 1, Item::reasoning("thinking")),
                event("t1", 2, Item::Message(Message::assistant("b"))),
            ])
            .await
            .expect("append");

        let latest_first = store
            .history("t1", HistoryQuery::default())
            .await
            .expect("history");
        let seqs: Vec<u64> = latest_first.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![2, 1, 0]);

        let messages_after_zero = store
            .history(
                "t1",
                HistoryQuery {
                    after: Some(0),
                    kinds: Some(vec![ItemKind::Message]),
                    order: SortOrder::Asc,
                    limit: None,
                },
            )
            .await
            .expect("history");
        assert_eq!(messages_after_zero.len(), 1);
        assert_eq!(messages_after_zero[0].seq, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_rejects_context_change_while_running() {
        let store = MemoryThreadStore::new();
        store.insert(new_thread("t1")).await.expect("insert");
        store
            .update(
                "t1",
                ThreadPatch {
                    state: Some(ThreadState::Running),
                    ..ThreadPatch::default()
                },
            )
            .await
            .expect("start running");

        let error = store
            .update(
                "t1",
                ThreadPatch {
                    context: Some(json!({"k": 1})),
                    ..ThreadPatch::default()
                },
            )
            .await
            .expect_err("context change while running should fail");
        assert!(matches!(error, StoreError::Conflict(_)));

        let stopped = store
            .update(
                "t1",
                ThreadPatch {
                    context: Some(json!({"k": 1})),
                    state: Some(ThreadState::Stopped),
                    ..ThreadPatch::default()
                },
            )
            .await
            .expect("stopping patch may carry context");
        assert_eq!(stopped.context, json!({"k": 1}));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn insert_duplicate_tid_conflicts() {
        let store = MemoryThreadStore::new();
        store.insert(new_thread("t1")).await.expect("insert");
        let error = store
            .insert(new_thread("t1"))
            .await
            .expect_err("duplicate tid");
        assert!(matches!(error, StoreError::Conflict(_)));
    }
}
