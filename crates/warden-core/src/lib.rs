//! Warden Core Library
//!
//! Trusted mediator for sandboxed AI agents: every tool call an agent makes
//! crosses the sandbox boundary through [`Mediator::handle_tool_call`], which
//! applies budgets, repetition guards and an ordered policy, dispatches what
//! is allowed, denies with corrective feedback, and escalates the rest to a
//! human operator through the [`escalation`] channel.

pub mod adapter;
pub mod budget;
pub mod config;
pub mod error;
pub mod escalation;
pub mod fingerprint;
pub mod guard;
pub mod mediator;
pub mod metrics;
pub mod normalize;
pub mod obs;
pub mod policy;
pub mod request;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use adapter::{AdapterRegistry, AgentAdapter, GenericAdapter, StreamJsonAdapter};
pub use budget::{
    RateLimit, RateLimiter, SessionBudget, EXECUTION_MS, RATE_LIMIT_RULE, TOOL_CALLS,
};
pub use config::{MediatorConfig, SessionConfig, STATE_DIR_ENV};
pub use error::{ErrorKind, MediatorError, MediatorResult};
pub use escalation::{
    inspect_lock, EscalationBroker, EscalationError, EscalationListener, EscalationRecord,
    EscalationRequest, EscalationResolution, ListenerLock, LockStatus, PendingPrompt,
    ResolutionOutcome, ResolutionWatcher,
};
pub use fingerprint::Fingerprint;
pub use guard::{GuardConfig, GuardVerdict, RepetitionGuard, GUARD_RULE};
pub use mediator::{Mediator, ToolDispatcher};
pub use normalize::{normalize_dispatch_error, DispatchError, INVALID_PARAMS};
pub use policy::{
    standard_engine, Condition, EvaluationResult, NetworkMode, NetworkPolicy, PolicyEngine,
    PolicyError, PolicyRule, StandardPolicy,
};
pub use request::{CallStatus, Decision, PolicyDecision, ToolCallRequest, ToolCallResult};
pub use session::{Session, SessionState};
pub use telemetry::init_tracing;
pub use transport::{serve_connection, serve_session, AgentResponse};
