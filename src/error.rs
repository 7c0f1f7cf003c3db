//! Error types for the recurrence and scheduling core.

/// Top-level error type for cadence.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    /// Invalid configuration (cache size, frequency fields, timezone name).
    #[error("config error: {0}")]
    Config(String),

    /// Recurrence rule text could not be parsed or compiled.
    #[error("rule error: {0}")]
    Rule(String),

    /// A mutation referenced a task id the store does not know.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A caller-supplied argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Task or timestamp store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Event listener failure.
    #[error("listener error: {0}")]
    Listener(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CadenceError>;
