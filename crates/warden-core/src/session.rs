//! Session lifecycle, budgets and per-session guard state.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::AgentAdapter;
use crate::budget::{RateLimiter, SessionBudget};
use crate::config::{MediatorConfig, SessionConfig};
use crate::error::{MediatorError, MediatorResult};
use crate::escalation::{EscalationRecord, ResolutionWatcher};
use crate::fingerprint::Fingerprint;
use crate::guard::{GuardVerdict, RepetitionGuard};
use crate::obs;

/// `Initializing → Ready → Closed`. No other transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Ready,
    Closed,
}

/// One agent session: its sandbox, budgets and guard windows.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    escalation_dir: PathBuf,
    record: EscalationRecord,
    state: Mutex<SessionState>,
    budget: SessionBudget,
    rate_limiter: Option<RateLimiter>,
    call_guard: RepetitionGuard,
    step_guard: RepetitionGuard,
    watcher: Mutex<Option<ResolutionWatcher>>,
    opened_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(config: SessionConfig, mediator: &MediatorConfig) -> Self {
        let escalation_dir = config.resolved_escalation_dir(&mediator.state_dir);
        let record = EscalationRecord::new(&config.session_id, &escalation_dir, &config.label);
        Self {
            budget: SessionBudget::new(config.budgets.clone()),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            call_guard: RepetitionGuard::new(
                format!("{}:call", config.session_id),
                mediator.call_guard,
            ),
            step_guard: RepetitionGuard::new(
                format!("{}:step", config.session_id),
                mediator.step_guard,
            ),
            escalation_dir,
            record,
            config,
            state: Mutex::new(SessionState::Initializing),
            watcher: Mutex::new(None),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.config.sandbox_root
    }

    pub fn escalation_dir(&self) -> &Path {
        &self.escalation_dir
    }

    pub fn record(&self) -> &EscalationRecord {
        &self.record
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn budget(&self) -> &SessionBudget {
        &self.budget
    }

    pub fn call_guard(&self) -> &RepetitionGuard {
        &self.call_guard
    }

    pub fn step_guard(&self) -> &RepetitionGuard {
        &self.step_guard
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail unless the session accepts calls.
    pub fn ensure_ready(&self) -> MediatorResult<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Initializing => Err(MediatorError::SessionNotReady(self.id().into())),
            SessionState::Closed => Err(MediatorError::SessionClosed(self.id().into())),
        }
    }

    pub(crate) fn mark_ready(&self, watcher: Option<ResolutionWatcher>) -> MediatorResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            SessionState::Initializing => {
                *state = SessionState::Ready;
                *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = watcher;
                obs::emit_session_ready(self.id());
                Ok(())
            }
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(MediatorError::SessionClosed(self.id().into())),
        }
    }

    /// Move to `Closed`. Returns `false` if it was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.stop();
        }
        true
    }

    /// Restore initial budgets and forget guard and rate-limit history.
    pub(crate) async fn reset(&self) {
        self.budget.reset();
        if let Some(limiter) = &self.rate_limiter {
            limiter.clear();
        }
        self.call_guard.clear().await;
        self.step_guard.clear().await;
    }

    /// Record a call against the rate limit. `true` when within the limit.
    pub fn admit_rate(&self, now: DateTime<Utc>) -> bool {
        self.rate_limiter
            .as_ref()
            .map_or(true, |limiter| limiter.admit(now))
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Fingerprint an agent step through `adapter` and observe it on the
    /// step guard. Events the adapter does not treat as steps are clear.
    pub async fn record_step(&self, adapter: &dyn AgentAdapter, event: &Value) -> GuardVerdict {
        let Some(summary) = adapter.summarize_step(event) else {
            return GuardVerdict::Clear { occurrences: 0 };
        };
        let fingerprint = Fingerprint::of_value(&summary);
        let verdict = self.step_guard.observe(&fingerprint, Utc::now()).await;
        if verdict.is_loop() {
            obs::emit_loop_suspected(self.step_guard.name(), &fingerprint, verdict.occurrences());
        }
        verdict
    }
}
