//! Model provider contract.

use async_trait::async_trait;

use crate::errors::ModelError;
use crate::types::{ModelRequest, ModelResponse};

/// A language model a thread can call.
///
/// Implementations own their wire protocol. The engine only relies on
/// `generate` returning the full response for one turn.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> &str;

    fn model_id(&self) -> &str;

    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}
