//! In-process escalation hand-off.
//!
//! Each open escalation owns a oneshot sender; only the call that opened it
//! awaits the receiver. Resolution is first-wins: the resolved map remembers
//! terminal decisions of live sessions so a repeated resolve returns the
//! original without side effects. Closing a session forgets its decisions;
//! the resolution artifact on disk stays authoritative after that.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

use crate::obs;

use super::artifact::{write_request, write_resolution, EscalationRequest, EscalationResolution};
use super::error::{EscalationError, EscalationResult};

/// Capacity of the new-request feed for in-process operators.
const FEED_CAPACITY: usize = 64;

/// Closed session ids remembered to refuse late escalations.
const CLOSED_SESSION_MEMORY: usize = 1024;

/// Handle held by the suspended call.
#[derive(Debug)]
pub struct EscalationTicket {
    pub escalation_id: String,
    pub session_id: String,
    receiver: oneshot::Receiver<EscalationResolution>,
}

/// Outcome of [`EscalationBroker::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// This call decided the escalation.
    Applied(EscalationResolution),
    /// It was already decided; the original decision is returned.
    AlreadyResolved(EscalationResolution),
}

impl ResolveOutcome {
    pub fn resolution(&self) -> &EscalationResolution {
        match self {
            ResolveOutcome::Applied(r) | ResolveOutcome::AlreadyResolved(r) => r,
        }
    }

    pub fn into_resolution(self) -> EscalationResolution {
        match self {
            ResolveOutcome::Applied(r) | ResolveOutcome::AlreadyResolved(r) => r,
        }
    }
}

struct PendingEscalation {
    request: EscalationRequest,
    escalation_dir: PathBuf,
    sender: oneshot::Sender<EscalationResolution>,
}

struct ResolvedEscalation {
    session_id: String,
    resolution: EscalationResolution,
}

#[derive(Default)]
struct BrokerState {
    pending: HashMap<String, PendingEscalation>,
    resolved: HashMap<String, ResolvedEscalation>,
    /// Most recently closed first; bounded by `CLOSED_SESSION_MEMORY`.
    closed_sessions: VecDeque<String>,
}

impl BrokerState {
    fn is_closed(&self, session_id: &str) -> bool {
        self.closed_sessions.iter().any(|s| s == session_id)
    }

    fn mark_closed(&mut self, session_id: &str) {
        self.closed_sessions.retain(|s| s != session_id);
        self.closed_sessions.push_front(session_id.to_string());
        self.closed_sessions.truncate(CLOSED_SESSION_MEMORY);
    }
}

/// Routes escalations between suspended calls and whoever resolves them.
pub struct EscalationBroker {
    state: Mutex<BrokerState>,
    feed: broadcast::Sender<EscalationRequest>,
}

impl Default for EscalationBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationBroker {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(BrokerState::default()),
            feed,
        }
    }

    /// Subscribe to newly opened escalations.
    pub fn subscribe(&self) -> broadcast::Receiver<EscalationRequest> {
        self.feed.subscribe()
    }

    /// Open an escalation: write its request artifact and register the waiter.
    pub async fn open(
        &self,
        request: EscalationRequest,
        escalation_dir: &Path,
    ) -> EscalationResult<EscalationTicket> {
        let mut state = self.state.lock().await;
        if state.is_closed(&request.session_id) {
            return Err(EscalationError::SessionClosed(request.session_id.clone()));
        }
        write_request(escalation_dir, &request)?;

        let (sender, receiver) = oneshot::channel();
        let ticket = EscalationTicket {
            escalation_id: request.escalation_id.clone(),
            session_id: request.session_id.clone(),
            receiver,
        };
        obs::emit_escalation_opened(&request);
        // No subscribers is fine: the file artifact is the durable route.
        let _ = self.feed.send(request.clone());
        state.pending.insert(
            request.escalation_id.clone(),
            PendingEscalation {
                request,
                escalation_dir: escalation_dir.to_path_buf(),
                sender,
            },
        );
        Ok(ticket)
    }

    /// Resolve an escalation. The first resolution wins.
    ///
    /// # Errors
    ///
    /// `EscalationError::UnknownEscalation` if the id was never opened here.
    pub async fn resolve(
        &self,
        resolution: EscalationResolution,
    ) -> EscalationResult<ResolveOutcome> {
        let mut state = self.state.lock().await;
        Self::resolve_locked(&mut state, resolution)
    }

    fn resolve_locked(
        state: &mut BrokerState,
        resolution: EscalationResolution,
    ) -> EscalationResult<ResolveOutcome> {
        if let Some(existing) = state.resolved.get(&resolution.escalation_id) {
            debug!(escalation_id = %resolution.escalation_id, "escalation already resolved");
            return Ok(ResolveOutcome::AlreadyResolved(existing.resolution.clone()));
        }
        let pending = state
            .pending
            .remove(&resolution.escalation_id)
            .ok_or_else(|| EscalationError::UnknownEscalation(resolution.escalation_id.clone()))?;

        // The artifact is authoritative across processes: if the listener
        // already wrote a different decision, that one stands.
        let effective = match write_resolution(&pending.escalation_dir, &resolution) {
            Ok(outcome) => outcome.effective(resolution),
            Err(e) => {
                warn!(
                    escalation_id = %resolution.escalation_id,
                    error = %e,
                    "failed to persist escalation resolution"
                );
                resolution
            }
        };

        obs::emit_escalation_resolved(&pending.request, &effective);
        state.resolved.insert(
            effective.escalation_id.clone(),
            ResolvedEscalation {
                session_id: pending.request.session_id.clone(),
                resolution: effective.clone(),
            },
        );
        // The waiter may have given up already; nothing to deliver then.
        let _ = pending.sender.send(effective.clone());
        Ok(ResolveOutcome::Applied(effective))
    }

    /// Wait for the ticket's resolution, bounded by `timeout`.
    ///
    /// On expiry the escalation is resolved as timed out, so a late operator
    /// answer becomes a no-op.
    pub async fn await_resolution(
        &self,
        ticket: EscalationTicket,
        timeout: Duration,
    ) -> EscalationResolution {
        let escalation_id = ticket.escalation_id;
        match tokio::time::timeout(timeout, ticket.receiver).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => EscalationResolution::cancelled(&escalation_id, "escalation abandoned"),
            Err(_) => match self.resolve(EscalationResolution::timed_out(&escalation_id)).await {
                Ok(outcome) => outcome.into_resolution(),
                Err(_) => EscalationResolution::timed_out(&escalation_id),
            },
        }
    }

    /// Stop accepting escalations for a session, deny everything pending and
    /// forget the session's decisions. Returns the number cancelled.
    pub async fn cancel_session(&self, session_id: &str, reason: &str) -> usize {
        let mut state = self.state.lock().await;
        state.mark_closed(session_id);
        let ids: Vec<String> = state
            .pending
            .values()
            .filter(|p| p.request.session_id == session_id)
            .map(|p| p.request.escalation_id.clone())
            .collect();
        for id in &ids {
            let _ = Self::resolve_locked(&mut state, EscalationResolution::cancelled(id, reason));
        }
        state.resolved.retain(|_, r| r.session_id != session_id);
        ids.len()
    }

    /// Allow a previously closed session id to escalate again.
    pub async fn reopen_session(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        state.closed_sessions.retain(|s| s != session_id);
        state.resolved.retain(|_, r| r.session_id != session_id);
    }

    /// Open escalation ids, optionally limited to one session.
    pub async fn pending_ids(&self, session_id: Option<&str>) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .pending
            .values()
            .filter(|p| session_id.map_or(true, |s| p.request.session_id == s))
            .map(|p| p.request.escalation_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn resolution(&self, escalation_id: &str) -> Option<EscalationResolution> {
        self.state
            .lock()
            .await
            .resolved
            .get(escalation_id)
            .map(|r| r.resolution.clone())
    }

    /// Decisions currently remembered in memory.
    pub async fn resolved_count(&self) -> usize {
        self.state.lock().await.resolved.len()
    }
}
