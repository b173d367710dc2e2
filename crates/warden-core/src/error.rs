//! Mediator error taxonomy.
//!
//! Policy outcomes, dispatch failures and escalation timeouts are never
//! errors: they come back as a [`ToolCallResult`](crate::request::ToolCallResult).
//! What remains here is either a lifecycle problem the caller must handle
//! (session not ready or closed, budget exhausted) or a setup error that
//! should abort startup.

use serde::{Deserialize, Serialize};

use crate::escalation::EscalationError;
use crate::policy::PolicyError;

/// Stable discriminant consumers branch on (also sent over the agent socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionNotReady,
    SessionClosed,
    SessionInitFailed,
    BudgetExhausted,
    InvalidRequest,
    UnknownSession,
    UnknownAdapter,
    DuplicateRegistration,
    Config,
    Escalation,
}

impl ErrorKind {
    /// Setup errors abort startup; the rest are per-call conditions.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::SessionInitFailed
                | ErrorKind::UnknownAdapter
                | ErrorKind::DuplicateRegistration
                | ErrorKind::Config
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    #[error("session {0} is not ready yet")]
    SessionNotReady(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("session {session_id} failed to initialise: {reason}")]
    SessionInitFailed { session_id: String, reason: String },

    #[error("budget exhausted: {dimension}")]
    BudgetExhausted { dimension: String },

    #[error("invalid tool call request: {0}")]
    InvalidRequest(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown agent adapter: {0}")]
    UnknownAdapter(String),

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),
}

impl MediatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediatorError::SessionNotReady(_) => ErrorKind::SessionNotReady,
            MediatorError::SessionClosed(_) => ErrorKind::SessionClosed,
            MediatorError::SessionInitFailed { .. } => ErrorKind::SessionInitFailed,
            MediatorError::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            MediatorError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            MediatorError::UnknownSession(_) => ErrorKind::UnknownSession,
            MediatorError::UnknownAdapter(_) => ErrorKind::UnknownAdapter,
            MediatorError::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            MediatorError::Config(_) | MediatorError::Policy(_) => ErrorKind::Config,
            MediatorError::Escalation(_) => ErrorKind::Escalation,
        }
    }

    pub fn budget_exhausted(dimension: impl Into<String>) -> Self {
        MediatorError::BudgetExhausted {
            dimension: dimension.into(),
        }
    }
}

/// Result type for mediator operations.
pub type MediatorResult<T> = std::result::Result<T, MediatorError>;
