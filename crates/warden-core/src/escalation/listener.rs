//! Operator-side escalation listener.
//!
//! Holds the host-wide [`ListenerLock`] for its whole lifetime, so at most one
//! listener presents escalations to an operator. Each request is handed out
//! by [`EscalationListener::poll`] at most once. Delivered ids are forgotten
//! once the request is no longer pending (resolved, or its session is gone).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::artifact::{
    pending_requests, write_resolution, EscalationRequest, EscalationResolution, WriteOutcome,
};
use super::error::EscalationResult;
use super::lock::{pid_alive, ListenerLock};
use super::record::{list_sessions, EscalationRecord};

/// A request ready to be shown to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPrompt {
    pub session_id: String,
    pub session_label: String,
    pub escalation_dir: PathBuf,
    pub request: EscalationRequest,
}

#[derive(Debug)]
pub struct EscalationListener {
    lock: ListenerLock,
    state_dir: PathBuf,
    delivered: HashSet<String>,
}

impl EscalationListener {
    /// Acquire the listener lock.
    ///
    /// # Errors
    ///
    /// `EscalationError::ListenerActive` when another listener is running;
    /// callers must exit rather than retry.
    pub fn start(state_dir: &Path) -> EscalationResult<Self> {
        let lock = ListenerLock::acquire(state_dir)?;
        info!(state_dir = %state_dir.display(), "escalation listener started");
        Ok(Self {
            lock,
            state_dir: state_dir.to_path_buf(),
            delivered: HashSet::new(),
        })
    }

    pub fn lock(&self) -> &ListenerLock {
        &self.lock
    }

    /// Registered sessions whose owning process is still alive.
    pub fn live_sessions(&self) -> EscalationResult<Vec<EscalationRecord>> {
        let mut records = list_sessions(&self.state_dir)?;
        records.retain(|record| {
            let alive = pid_alive(record.owner_pid);
            if !alive {
                debug!(
                    session_id = %record.session_id,
                    pid = record.owner_pid,
                    "skipping session of dead process"
                );
            }
            alive
        });
        Ok(records)
    }

    /// New unresolved requests across live sessions. Each escalation id is
    /// returned at most once over the listener's lifetime.
    pub fn poll(&mut self) -> EscalationResult<Vec<PendingPrompt>> {
        let mut prompts = Vec::new();
        let mut still_pending = HashSet::new();
        for record in self.live_sessions()? {
            for request in pending_requests(&record.escalation_dir)? {
                still_pending.insert(request.escalation_id.clone());
                if !self.delivered.insert(request.escalation_id.clone()) {
                    continue;
                }
                prompts.push(PendingPrompt {
                    session_id: record.session_id.clone(),
                    session_label: record.label.clone(),
                    escalation_dir: record.escalation_dir.clone(),
                    request,
                });
            }
        }
        self.delivered.retain(|id| still_pending.contains(id));
        Ok(prompts)
    }

    /// Ids delivered and still awaiting a decision.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Write the operator's decision. If the mediator already resolved the
    /// escalation (timeout, session close), the existing decision is kept.
    pub fn resolve(
        &self,
        prompt: &PendingPrompt,
        resolution: &EscalationResolution,
    ) -> EscalationResult<WriteOutcome> {
        let outcome = write_resolution(&prompt.escalation_dir, resolution)?;
        match &outcome {
            WriteOutcome::Written => info!(
                escalation_id = %resolution.escalation_id,
                outcome = %resolution.outcome,
                "escalation resolved by operator"
            ),
            WriteOutcome::AlreadyResolved(existing) => info!(
                escalation_id = %existing.escalation_id,
                outcome = %existing.outcome,
                "escalation was already resolved"
            ),
        }
        Ok(outcome)
    }
}
