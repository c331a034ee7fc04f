//! Error types for the introduction task scheduler.

/// Top-level error type for task processing and persistence.
///
/// Collaborator failures never appear here: [`crate::task::PersistentTask::process`]
/// absorbs them into a retry backoff. What remains are failures the caller
/// has to know about.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The durable commit of a task's state failed. Nothing was published.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Configuration could not be read, parsed, or validated.
    #[error("config error: {0}")]
    Config(String),

    /// A task or store lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// A stored or supplied value failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of an external signal source (message store, trust store, config).
///
/// Always treated as transient: the task retries sooner instead of assuming
/// a zero count.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// The source could not answer right now.
    #[error("signal source unavailable: {0}")]
    Unavailable(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TaskError>;
