use thiserror::Error;

use crate::classify::EnrichedError;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(#[source] serde_json::Error),

    /// A classified failure of an executor call or guarded action.
    #[error("{0}")]
    Operation(#[from] EnrichedError),

    #[error("task join failed: {0}")]
    Join(String),

    #[error("{0}")]
    Other(String),
}

impl CourierError {
    /// The ErrorRecord attached to this error, if it went through the classifier.
    pub fn record(&self) -> Option<&crate::domain::ErrorRecord> {
        match self {
            CourierError::Operation(enriched) => Some(enriched.record()),
            _ => None,
        }
    }
}
