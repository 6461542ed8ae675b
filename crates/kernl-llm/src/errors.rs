use thiserror::Error;

/// Failure raised by a model provider.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("model configuration error: {0}")]
    Configuration(String),
}

impl ModelError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
