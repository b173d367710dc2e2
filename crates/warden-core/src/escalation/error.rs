//! Error types for the escalation channel.

/// Errors produced by the escalation channel and its listener.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("an escalation listener is already running (pid {pid})")]
    ListenerActive { pid: u32 },

    #[error("escalation listener lock failed: {0}")]
    Lock(String),

    #[error("identifier '{0}' is not a valid file name")]
    InvalidId(String),

    #[error("escalation not found: {0}")]
    UnknownEscalation(String),

    #[error("session {0} is closed; no new escalations accepted")]
    SessionClosed(String),

    #[error("escalation artifact is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("escalation I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for escalation operations.
pub type EscalationResult<T> = std::result::Result<T, EscalationError>;
