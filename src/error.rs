use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Coarse classification of [`FlowError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Lookup,
    Configuration,
    Provider,
    Internal,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("validation failed for step `{step}`")]
    StepRejected { step: String },

    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("no route matched `{0}` and no default route is configured")]
    UnknownRoute(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("language model error: {0}")]
    Provider(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Validation(_) | FlowError::StepRejected { .. } => ErrorKind::Validation,
            FlowError::ToolNotFound(_) | FlowError::UnknownRoute(_) => ErrorKind::Lookup,
            FlowError::Configuration(_) => ErrorKind::Configuration,
            FlowError::Provider(_) | FlowError::Timeout(_) => ErrorKind::Provider,
            FlowError::Protocol(_)
            | FlowError::Cancelled(_)
            | FlowError::Serde(_)
            | FlowError::Io(_) => ErrorKind::Internal,
        }
    }
}
