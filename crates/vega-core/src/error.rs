//! Central error types for the encode pipeline (thiserror-based).
//!
//! Per-frame failures (`ResourceExhausted`, `SyncTimeout`, `RetriesExhausted`,
//! `Engine`, `CallbackRejected`) drop that frame only — the session stays
//! usable. `EngineLost` is the one session-level failure: the engine reported
//! itself unusable and the session must be re-initialized before the next
//! submit.

use thiserror::Error;

use crate::engine::EngineStatus;

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, EncodeError>;

/// Top-level encode pipeline error.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// Invalid codec, profile or resolution. Fatal to `init`.
    #[error("invalid encoder configuration: {0}")]
    Configuration(String),

    /// No free surface became available within the bounded wait window.
    #[error("no free encode surface after {waited_ms} ms")]
    ResourceExhausted { waited_ms: u64 },

    /// The engine accepted the frame but did not complete it in time.
    #[error("completion sync timed out after {timeout_ms} ms")]
    SyncTimeout { timeout_ms: u64 },

    /// The engine stayed busy past the submit retry budget.
    #[error("engine busy past the {budget_ms} ms retry budget")]
    RetriesExhausted { budget_ms: u64 },

    /// Non-recoverable engine status for this frame. The session stays valid.
    #[error("engine rejected the operation: {status:?}")]
    Engine { status: EngineStatus },

    /// The engine reported itself unusable. The session dropped back to
    /// `Initialized` and requires a fresh `init`.
    #[error("engine session lost, re-init required")]
    EngineLost,

    /// The registered consumer declined the encoded frame.
    #[error("consumer rejected the encoded frame")]
    CallbackRejected,

    /// Operation invoked in a state that does not permit it.
    #[error("{op} is not valid in state {state}")]
    InvalidState { op: &'static str, state: &'static str },

    /// The dedicated worker thread has exited; the handle is dead.
    #[error("encoder worker is gone")]
    WorkerGone,

    /// Debug-dump I/O failure. Logged at the sink, never fatal to delivery.
    #[error("debug dump: {0}")]
    Dump(#[from] std::io::Error),
}

impl EncodeError {
    /// Whether this error invalidates the session (as opposed to dropping a
    /// single frame).
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, EncodeError::EngineLost | EncodeError::WorkerGone)
    }
}
