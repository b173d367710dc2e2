//! Structured observability hooks for mediator lifecycle events.
//!
//! Every event carries an `event` field (`call.decided`, `escalation.opened`,
//! ...) so log pipelines can filter on it. Session-scoped work runs inside
//! the `warden.session` span from [`session_span`].

use std::path::Path;

use tracing::{info, warn};

use crate::escalation::{EscalationRequest, EscalationResolution};
use crate::fingerprint::Fingerprint;
use crate::request::{Decision, ToolCallRequest};

/// The span used for session-scoped work, for `Instrument` in async code.
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("warden.session", session_id = %session_id)
}

pub fn emit_session_opened(session_id: &str, label: &str, sandbox_root: &Path) {
    info!(
        event = "session.opened",
        session_id = %session_id,
        label = %label,
        sandbox_root = %sandbox_root.display(),
    );
}

pub fn emit_session_ready(session_id: &str) {
    info!(event = "session.ready", session_id = %session_id);
}

/// Emit event: budgets and guard history were restored.
pub fn emit_session_reset(session_id: &str, exhausted: Option<&str>) {
    info!(
        event = "session.reset",
        session_id = %session_id,
        exhausted = exhausted.unwrap_or("none"),
    );
}

pub fn emit_session_closed(session_id: &str, escalations_cancelled: usize) {
    info!(
        event = "session.closed",
        session_id = %session_id,
        escalations_cancelled = escalations_cancelled,
    );
}

/// Emit event: a policy (or guard / rate-limit) decision was reached.
pub fn emit_call_decided(request: &ToolCallRequest, decision: Decision, rule: &str) {
    info!(
        event = "call.decided",
        request_id = %request.request_id,
        server = %request.server_name,
        tool = %request.tool_name,
        decision = %decision,
        rule = %rule,
    );
}

/// Emit event: a call was forwarded to its tool server.
pub fn emit_call_dispatched(request: &ToolCallRequest, success: bool, duration_ms: u64) {
    info!(
        event = "call.dispatched",
        request_id = %request.request_id,
        tool = %request.tool_name,
        success = success,
        duration_ms = duration_ms,
    );
}

pub fn emit_escalation_opened(request: &EscalationRequest) {
    info!(
        event = "escalation.opened",
        escalation_id = %request.escalation_id,
        session_id = %request.session_id,
        tool = %request.request.tool_name,
        rule = %request.rule_name,
    );
}

pub fn emit_escalation_resolved(request: &EscalationRequest, resolution: &EscalationResolution) {
    info!(
        event = "escalation.resolved",
        escalation_id = %request.escalation_id,
        session_id = %request.session_id,
        outcome = %resolution.outcome,
        resolved_by = %resolution.resolved_by,
    );
}

/// Emit event: a repetition guard crossed its threshold (warning level).
pub fn emit_loop_suspected(guard: &str, fingerprint: &Fingerprint, occurrences: u32) {
    warn!(
        event = "guard.loop_suspected",
        guard = %guard,
        fingerprint = %fingerprint.short(),
        occurrences = occurrences,
    );
}

/// Emit event: a budget dimension ran out (warning level).
pub fn emit_budget_exhausted(session_id: &str, dimension: &str) {
    warn!(event = "budget.exhausted", session_id = %session_id, dimension = %dimension);
}
