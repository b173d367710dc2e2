//! Error types for the policy module.

/// Rule set construction errors. These are setup failures and abort startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("duplicate policy rule name: {0}")]
    DuplicateRule(String),

    #[error("policy rule at position {0} has an empty name")]
    UnnamedRule(usize),

    #[error("policy rule '{0}' has an empty reason")]
    MissingReason(String),

    #[error("policy rule '{0}' allows every call; allow rules need a condition")]
    UnconditionalAllow(String),
}

/// Result type for policy operations.
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
