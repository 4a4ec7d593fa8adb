use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for drover operations.
///
/// Structured variants for the common failure cases, classification
/// helpers for the run controller, and convenience constructors for the
/// hot paths.
#[derive(Error, Debug)]
pub enum DroverError {
    // === Queue errors ===
    /// A run with this id already exists in the queue.
    #[error("run already queued: {run_id}")]
    RunExists { run_id: String },

    /// No run with this id was found.
    #[error("no such run: {run_id}")]
    RunNotFound { run_id: String },

    /// A run id that does not match `<bench>.<num><letter>`.
    #[error("malformed run id: '{raw}'")]
    InvalidRunId { raw: String },

    /// The sequence file held something other than `<num>:<letter>`.
    #[error("sequence file is corrupt: {detail}")]
    SequenceCorrupt { detail: String },

    /// The queue lock file could not be acquired or created.
    #[error("queue lock failed: '{path}': {detail}")]
    QueueLock { path: PathBuf, detail: String },

    /// A parameter repository file was expected but missing.
    #[error("parameter repository not found: '{path}'")]
    ParamsNotFound { path: PathBuf },

    // === Run control errors ===
    /// The run was aborted before completing.
    #[error("run aborted: {reason}")]
    RunAborted { reason: String },

    /// The agent woke after the trigger time had already passed.
    #[error("trigger time has expired; need {shortfall_ms} ms more")]
    TriggerExpired { shortfall_ms: i64 },

    /// Another run is already executing.
    #[error("a run is already in progress: {run_id}")]
    RunInProgress { run_id: String },

    /// The kill target does not match the run currently executing.
    #[error("kill requested for {requested} but current run is {current}")]
    KillMismatch { requested: String, current: String },

    // === Driver errors ===
    /// Driver code raised a fatal error; the run cannot continue.
    #[error("fatal driver error in {operation}: {detail}")]
    DriverFatal { operation: String, detail: String },

    /// No driver factory registered under this name.
    #[error("no such driver: {name}")]
    DriverNotFound { name: String },

    /// An operation returned without its invoke time recorded.
    #[error("{operation}: {detail}")]
    TimingIncomplete { operation: String, detail: String },

    /// A blocking wait was woken while the run was not being stopped.
    #[error("worker interrupted outside of shutdown")]
    Interrupted,

    // === Configuration errors ===
    /// A driver configuration that cannot drive a run.
    #[error("invalid driver config: {detail}")]
    InvalidConfig { detail: String },

    // === Transport errors ===
    /// The master could not be reached.
    #[error("master unreachable: {detail}")]
    MasterUnreachable { detail: String },

    /// An agent could not be reached.
    #[error("agent '{agent}' unreachable: {detail}")]
    AgentUnreachable { agent: String, detail: String },

    /// A wire message failed to encode or decode.
    #[error("wire protocol error: {detail}")]
    Protocol { detail: String },

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (parameter repository, wire payloads).
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl DroverError {
    /// Whether this error must abort the entire run.
    ///
    /// Ordinary operation failures are counted and the run continues;
    /// everything classified here tears the run down.
    pub const fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::DriverFatal { .. }
                | Self::TriggerExpired { .. }
                | Self::TimingIncomplete { .. }
                | Self::MasterUnreachable { .. }
                | Self::AgentUnreachable { .. }
                | Self::Interrupted
        )
    }

    /// Whether retrying the same call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueLock { .. }
                | Self::MasterUnreachable { .. }
                | Self::AgentUnreachable { .. }
        )
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a fatal driver error.
    pub fn fatal(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::DriverFatal {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    /// Create a config error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `DroverError`.
pub type Result<T> = std::result::Result<T, DroverError>;
