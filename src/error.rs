use thiserror::Error;

/// Failure kinds surfaced by the execution core.
///
/// Everything still travels as `anyhow::Error`; wrapping one of these kinds
/// lets callers downcast when they need to distinguish, say, a schema
/// rejection from a missing blob.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid net: {0}")]
    InvalidNet(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("type mismatch: blob holds {stored}, requested {requested}")]
    TypeMismatch {
        stored: &'static str,
        requested: &'static str,
    },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("step failure: {0}")]
    StepFailure(String),
    #[error("worker exception: {0}")]
    WorkerException(String),
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("invalid sync: {0}")]
    InvalidSync(String),
    #[error("data size mismatch: {0}")]
    DataSizeMismatch(String),
}
