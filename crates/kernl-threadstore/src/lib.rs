pub mod fs;
pub mod memory;
pub mod store;
pub mod types;

pub use fs::FsThreadStore;
pub use memory::MemoryThreadStore;
pub use store::{StoreError, StoreResult, ThreadStore};
pub use types::{
    GetThreadOptions, HistoryQuery, NewThread, SortOrder, StoredThread, ThreadEvent,
    ThreadFilter, ThreadListQuery, ThreadPatch, ThreadRecord, ThreadState, Timestamp,
    now_millis,
};
