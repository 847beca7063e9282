use thiserror::Error;

/// Rejected tuning values. Raised once, when a context or component is built.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: f64,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(&'static str),
}

impl ConfigError {
    pub fn out_of_range(field: &'static str, requirement: &'static str, value: f64) -> Self {
        ConfigError::OutOfRange {
            field,
            requirement,
            value,
        }
    }
}

/// Failures reported by a presentation surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    #[error("out of GPU memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },
    #[error("render device lost")]
    DeviceLost,
}

impl BackendError {
    pub fn submission(message: impl Into<String>) -> Self {
        BackendError::SubmissionFailed(message.into())
    }
}

/// Errors raised while loading or saving a persisted [`crate::RenderConfig`].
#[derive(Debug, Error)]
pub enum ConfigIoError {
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
    #[error("failed to access render config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse render config: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Errors raised while setting up background preparation.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to build preparation pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
