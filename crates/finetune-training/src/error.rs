use thiserror::Error;

pub type ValidationResult<T> = std::result::Result<T, ValidationError>;
pub type StrategyResult<T> = std::result::Result<T, StrategyError>;
pub type LibraryResult<T> = std::result::Result<T, LibraryError>;

/// A submitted configuration was rejected before any run was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// An adaptation strategy could not be applied to a base model.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid rank {0}: must be >= 1")]
    InvalidRank(u32),

    #[error("invalid alpha {0}: must be > 0")]
    InvalidAlpha(f64),

    #[error("invalid dropout {0}: must be in [0, 1)")]
    InvalidDropout(f64),

    #[error("invalid quantization: {0}")]
    InvalidQuantization(String),

    #[error("unsupported base model: {0}")]
    UnsupportedModel(String),

    #[error(transparent)]
    Library(#[from] LibraryError),
}

/// Failure reported by the model-training-library collaborator.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to load tokenizer for {reference}: {reason}")]
    Tokenizer { reference: String, reason: String },

    #[error("failed to load model {reference}: {reason}")]
    Model { reference: String, reason: String },

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("training loop failed: {0}")]
    Training(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
