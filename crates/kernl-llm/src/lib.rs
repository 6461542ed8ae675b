//! Language-model port for Kernl.
//!
//! Defines the conversation items a thread exchanges with a model, the
//! `LanguageModel` contract providers implement, and the registry that maps
//! `provider/modelId` references to model instances.

pub mod errors;
pub mod provider;
pub mod registry;
pub mod types;

pub use errors::ModelError;
pub use provider::LanguageModel;
pub use registry::{ModelRegistry, model_key};
pub use types::*;
