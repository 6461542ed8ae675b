use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// The mutable per-thread context blob.
///
/// Clones share state. Tools running in the same fan-out that both write the
/// context must coordinate their own read-modify-write sequences; each
/// `update` call is atomic on its own.
#[derive(Clone, Debug, Default)]
pub struct ThreadContext {
    inner: Arc<Mutex<Value>>,
}

impl ThreadContext {
    pub fn new(value: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn snapshot(&self) -> Value {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, value: Value) -> Value {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, value)
    }

    pub fn update<R>(&self, apply: impl FnOnce(&mut Value) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard)
    }
}
