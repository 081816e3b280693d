//! Error taxonomy for the process pool.
//!
//! One variant per error *kind* from the design, not one per call site —
//! callers match on kind to decide whether to retry, surface, or ignore.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    #[error("pool is closed")]
    PoolClosed,

    #[error("failed to spawn child process: {0}")]
    ProcessSpawnFailed(String),

    #[error("stream I/O error: {0}")]
    StreamIoError(String),

    #[error("child process exited before the submission completed")]
    ProcessExitedDuringSubmission,

    #[error("submission was cancelled")]
    Cancelled,

    #[error("timed out waiting for submission to complete")]
    Timeout,

    #[error("manager callback failed: {0}")]
    ManagerCallbackFailed(String),
}
