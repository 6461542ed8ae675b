//! Registry of model instances keyed by `provider/modelId`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::ModelError;
use crate::provider::LanguageModel;

pub fn model_key(provider: &str, model_id: &str) -> String {
    format!("{provider}/{model_id}")
}

/// Shared map of registered models. Clones share the same underlying map so
/// a registry can be handed to many threads.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Arc<RwLock<HashMap<String, Arc<dyn LanguageModel>>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `model` under its key. A model already registered under the
    /// same key is kept, so repeated registration is a no-op.
    pub fn register(&self, model: Arc<dyn LanguageModel>) -> Result<String, ModelError> {
        let key = model_key(model.provider(), model.model_id());
        let mut models = self
            .models
            .write()
            .map_err(|_| ModelError::Configuration("model registry lock poisoned".to_string()))?;
        models.entry(key.clone()).or_insert(model);
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn LanguageModel>> {
        self.models
            .read()
            .ok()
            .and_then(|models| models.get(key).cloned())
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<dyn LanguageModel>, ModelError> {
        self.get(key)
            .ok_or_else(|| ModelError::Configuration(format!("model '{key}' is not registered")))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .models
            .read()
            .map(|models| models.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|models| models.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
