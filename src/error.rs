use thiserror::Error;

/// Failures that end (or, under a tolerant publish policy, interrupt) a single sensor worker.
///
/// None of these escalate past the worker that produced them. A requested shutdown is not an
/// error and never shows up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("invalid sensor configuration: {0}")]
    Configuration(String),
    #[error("connection to ingestion endpoint failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Transport(String),
}

impl SensorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}
