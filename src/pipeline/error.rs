use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors the pipeline reports synchronously to its caller.
///
/// Failures inside a running cycle (analyzers, callbacks, frame reads) never
/// surface here; they are logged and counted in the status instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The device or file could not be opened. Retry with another descriptor.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("no usable source attached")]
    NoSource,

    /// The operation is only allowed while the pipeline is not running.
    #[error("operation not allowed while the pipeline is running")]
    Running,

    #[error("invalid frame buffer capacity {0}, must be at least 1")]
    InvalidCapacity(usize),

    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PipelineError {
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }
}
