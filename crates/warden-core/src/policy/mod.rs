//! Policy: ordered, first-match-wins, default-deny rule evaluation.
//!
//! Every tool call is evaluated against an ordered list of named rules. The
//! first rule whose condition holds decides the call (allow, deny or
//! escalate). A rule set always ends in an unconditional rule, so an
//! evaluation can never come back empty.
//!
//! # Modules
//!
//! - [`condition`]: `Condition` predicates (tool, server, path, domain, command, size)
//! - [`rule`]: `PolicyRule`, `default_deny()`
//! - [`engine`]: `PolicyEngine::evaluate()` (first-match, default-deny)
//! - [`standard`]: `standard_rules()` for filesystem, fetch and exec tools
//! - [`error`]: `PolicyError` / `PolicyResult`

pub mod condition;
pub mod engine;
pub mod error;
pub mod rule;
pub mod standard;

pub use condition::{domain_matches, extract_host, is_inside_sandbox, Condition};
pub use engine::{EvaluationResult, PolicyEngine};
pub use error::{PolicyError, PolicyResult};
pub use rule::{PolicyRule, DEFAULT_RULE_NAME};
pub use standard::{
    standard_engine, standard_rules, DomainScope, NetworkMode, NetworkPolicy, StandardPolicy,
};
