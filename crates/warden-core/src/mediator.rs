//! The trusted mediator: the only path from an agent's tool call to a real
//! tool server.
//!
//! Per call, in order:
//!
//! 1. request shape and session state
//! 2. budget admission (`tool_calls` decrement, any exhausted dimension refuses)
//! 3. call-level repetition guard observation
//! 4. rate limit, then loop verdict (both short-circuit as `denied`)
//! 5. policy evaluation
//! 6. allow → dispatch; deny → `denied`; escalate → wait for the operator
//!
//! Dispatch failures come back as `error` results with a normalized message;
//! they never surface as `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn, Instrument};

use crate::adapter::AdapterRegistry;
use crate::budget::{EXECUTION_MS, RATE_LIMIT_RULE};
use crate::config::{MediatorConfig, SessionConfig};
use crate::error::{MediatorError, MediatorResult};
use crate::escalation::{
    EscalationBroker, EscalationRecord, EscalationRequest, ResolutionOutcome, ResolutionWatcher,
};
use crate::fingerprint::Fingerprint;
use crate::guard::{GuardVerdict, GUARD_RULE};
use crate::metrics::METRICS;
use crate::normalize::{normalize_dispatch_error, DispatchError};
use crate::obs;
use crate::policy::{standard_engine, EvaluationResult, PolicyEngine};
use crate::request::{Decision, PolicyDecision, ToolCallRequest, ToolCallResult};
use crate::session::Session;

/// Forwards a sanctioned call to the real tool server.
#[async_trait]
pub trait ToolDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: &ToolCallRequest) -> Result<Value, DispatchError>;
}

pub struct Mediator {
    config: MediatorConfig,
    engine: PolicyEngine,
    dispatcher: Arc<dyn ToolDispatcher>,
    broker: Arc<EscalationBroker>,
    adapters: AdapterRegistry,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Mediator {
    /// # Errors
    ///
    /// `MediatorError::Config` if `config` does not validate.
    pub fn new(
        config: MediatorConfig,
        engine: PolicyEngine,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> MediatorResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            dispatcher,
            broker: Arc::new(EscalationBroker::new()),
            adapters: AdapterRegistry::with_builtins(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// A mediator using the standard rule set built from `config`.
    pub fn with_standard_policy(
        config: MediatorConfig,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> MediatorResult<Self> {
        let engine = standard_engine(&config.standard_policy, &config.network)?;
        Self::new(config, engine, dispatcher)
    }

    /// Replace the adapter registry (registration happens before startup).
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// The in-process escalation broker; an embedded operator UI resolves
    /// escalations through it.
    pub fn broker(&self) -> &Arc<EscalationBroker> {
        &self.broker
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    // -- sessions ------------------------------------------------------------

    /// Create a session in `Initializing` state and register it with the
    /// escalation listener.
    pub async fn open_session(&self, config: SessionConfig) -> MediatorResult<Arc<Session>> {
        config.validate()?;
        let session_id = config.session_id.clone();

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&session_id) {
            if existing.state() != crate::session::SessionState::Closed {
                return Err(MediatorError::DuplicateRegistration(format!(
                    "session '{session_id}'"
                )));
            }
        }

        let session = Arc::new(Session::new(config, &self.config));
        let init_failed = |reason: String| MediatorError::SessionInitFailed {
            session_id: session_id.clone(),
            reason,
        };
        std::fs::create_dir_all(session.escalation_dir()).map_err(|e| {
            init_failed(format!(
                "cannot create escalation dir {}: {e}",
                session.escalation_dir().display()
            ))
        })?;
        session
            .record()
            .register(&self.config.state_dir)
            .map_err(|e| init_failed(format!("cannot register session: {e}")))?;

        self.broker.reopen_session(&session_id).await;
        sessions.insert(session_id.clone(), session.clone());
        obs::emit_session_opened(&session_id, &session.config().label, session.sandbox_root());
        Ok(session)
    }

    /// Move a session to `Ready` and start bridging resolution artifacts.
    pub async fn mark_ready(&self, session_id: &str) -> MediatorResult<()> {
        let session = self.session(session_id).await?;
        let watcher = ResolutionWatcher::spawn(
            self.broker.clone(),
            session_id.to_string(),
            session.escalation_dir().to_path_buf(),
            self.config.resolution_poll(),
        );
        session.mark_ready(Some(watcher))
    }

    /// [`open_session`](Self::open_session) followed by
    /// [`mark_ready`](Self::mark_ready).
    pub async fn start_session(&self, config: SessionConfig) -> MediatorResult<Arc<Session>> {
        let session_id = config.session_id.clone();
        let session = self.open_session(config).await?;
        self.mark_ready(&session_id).await?;
        Ok(session)
    }

    pub async fn session(&self, session_id: &str) -> MediatorResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| MediatorError::UnknownSession(session_id.to_string()))
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close a session: deny every pending escalation, drop guard state and
    /// deregister from the listener. Closing twice is a no-op.
    pub async fn close_session(&self, session_id: &str) -> MediatorResult<()> {
        let session = self.session(session_id).await?;
        if !session.mark_closed() {
            return Ok(());
        }

        let cancelled = self.broker.cancel_session(session_id, "session closed").await;
        session.call_guard().clear().await;
        session.step_guard().clear().await;
        if let Err(e) = EscalationRecord::deregister(&self.config.state_dir, session_id) {
            warn!(session_id = %session_id, error = %e, "failed to remove session record");
        }
        obs::emit_session_closed(session_id, cancelled);
        METRICS.flush();
        Ok(())
    }

    /// Close every open session (shutdown).
    pub async fn close_all(&self) {
        for session_id in self.session_ids().await {
            if let Err(e) = self.close_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to close session");
            }
        }
    }

    /// Restore a session's budgets and forget its guard and rate-limit
    /// history. Dimensions that ran out accept calls again afterwards.
    pub async fn reset_session(&self, session_id: &str) -> MediatorResult<()> {
        let session = self.session(session_id).await?;
        session.ensure_ready()?;
        let exhausted = session.budget().first_exhausted();
        session.reset().await;
        obs::emit_session_reset(session_id, exhausted.as_deref());
        Ok(())
    }

    /// Charge usage measured by the caller (tokens, bytes) against a budget
    /// dimension. All or nothing: returns what is left, or `None` when the
    /// dimension is unlimited.
    ///
    /// # Errors
    ///
    /// `MediatorError::BudgetExhausted` when less than `amount` is left.
    pub async fn consume_budget(
        &self,
        session_id: &str,
        dimension: &str,
        amount: u64,
    ) -> MediatorResult<Option<u64>> {
        let session = self.session(session_id).await?;
        session.ensure_ready()?;
        match session.budget().try_consume(dimension, amount) {
            Err(MediatorError::BudgetExhausted { dimension }) => {
                obs::emit_budget_exhausted(session_id, &dimension);
                Err(MediatorError::BudgetExhausted { dimension })
            }
            other => other,
        }
    }

    /// Observe one raw agent event on the session's step guard.
    pub async fn record_step(
        &self,
        session_id: &str,
        adapter_key: &str,
        event: &Value,
    ) -> MediatorResult<GuardVerdict> {
        let adapter = self.adapters.get(adapter_key)?;
        let session = self.session(session_id).await?;
        session.ensure_ready()?;
        Ok(session.record_step(adapter.as_ref(), event).await)
    }

    // -- calls ---------------------------------------------------------------

    /// Mediate one tool call.
    ///
    /// # Errors
    ///
    /// Only lifecycle conditions: invalid request shape, unknown, not-ready
    /// or closed session, and exhausted budgets. Every policy outcome and
    /// dispatch failure is an `Ok` result.
    pub async fn handle_tool_call(
        &self,
        session_id: &str,
        request: ToolCallRequest,
    ) -> MediatorResult<ToolCallResult> {
        self.mediate(session_id, request)
            .instrument(obs::session_span(session_id))
            .await
    }

    async fn mediate(
        &self,
        session_id: &str,
        request: ToolCallRequest,
    ) -> MediatorResult<ToolCallResult> {
        request.validate().map_err(MediatorError::InvalidRequest)?;
        let session = self.session(session_id).await?;
        session.ensure_ready()?;
        METRICS.inc_calls_received();
        let started = Instant::now();

        if let Err(e) = session.budget().admit_call() {
            if let MediatorError::BudgetExhausted { dimension } = &e {
                obs::emit_budget_exhausted(session_id, dimension);
            }
            return Err(e);
        }

        let now = Utc::now();
        let fingerprint = Fingerprint::of_value(&request.fingerprint_value());
        let verdict = session.call_guard().observe(&fingerprint, now).await;

        if !session.admit_rate(now) {
            let reason = session
                .rate_limiter()
                .map(|limiter| limiter.limit().deny_reason())
                .unwrap_or_else(|| "Rate limit exceeded.".to_string());
            return Ok(self.deny(&request, PolicyDecision::deny(RATE_LIMIT_RULE, reason), started));
        }

        if verdict.is_loop() {
            METRICS.inc_loops_suspected();
            obs::emit_loop_suspected(
                session.call_guard().name(),
                &fingerprint,
                verdict.occurrences(),
            );
            let reason = format!(
                "This identical call was made {} times within {} seconds without a different \
                 outcome. Stop repeating it: change the arguments, try another tool, or report \
                 that you are blocked.",
                verdict.occurrences(),
                session.call_guard().config().window_secs
            );
            return Ok(self.deny(&request, PolicyDecision::deny(GUARD_RULE, reason), started));
        }

        let evaluation = self.engine.evaluate(&request, session.sandbox_root());
        match evaluation.decision {
            Decision::Allow => {
                obs::emit_call_decided(&request, Decision::Allow, &evaluation.rule_name);
                METRICS.inc_calls_allowed();
                let decision = evaluation.to_policy_decision();
                Ok(self.dispatch(&session, &request, decision, started).await)
            }
            Decision::Deny => Ok(self.deny(&request, evaluation.to_policy_decision(), started)),
            Decision::Escalate => {
                obs::emit_call_decided(&request, Decision::Escalate, &evaluation.rule_name);
                METRICS.inc_calls_escalated();
                Ok(self.escalate(&session, request, evaluation, started).await)
            }
        }
    }

    fn deny(
        &self,
        request: &ToolCallRequest,
        decision: PolicyDecision,
        started: Instant,
    ) -> ToolCallResult {
        obs::emit_call_decided(request, Decision::Deny, &decision.rule);
        METRICS.inc_calls_denied();
        ToolCallResult::denied(&request.request_id, decision, elapsed_ms(started.elapsed()))
    }

    async fn dispatch(
        &self,
        session: &Session,
        request: &ToolCallRequest,
        decision: PolicyDecision,
        started: Instant,
    ) -> ToolCallResult {
        let dispatch_started = Instant::now();
        let timeout = self.config.dispatch_timeout();
        let outcome = match tokio::time::timeout(timeout, self.dispatcher.dispatch(request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::timeout(self.config.dispatch_timeout_ms)),
        };
        let dispatch_ms = elapsed_ms(dispatch_started.elapsed());
        session.budget().charge(EXECUTION_MS, dispatch_ms);
        let duration_ms = elapsed_ms(started.elapsed());

        match outcome {
            Ok(content) => {
                obs::emit_call_dispatched(request, true, dispatch_ms);
                ToolCallResult::success(&request.request_id, content, decision, duration_ms)
            }
            Err(error) => {
                METRICS.inc_dispatch_errors();
                obs::emit_call_dispatched(request, false, dispatch_ms);
                debug!(request_id = %request.request_id, error = ?error, "dispatch failed");
                let message = normalize_dispatch_error(&error);
                ToolCallResult::error(&request.request_id, message, decision, duration_ms)
            }
        }
    }

    async fn escalate(
        &self,
        session: &Session,
        request: ToolCallRequest,
        evaluation: EvaluationResult,
        started: Instant,
    ) -> ToolCallResult {
        let escalation = EscalationRequest::new(
            session.id(),
            request.clone(),
            &evaluation.rule_name,
            &evaluation.reason,
        );
        let ticket = match self.broker.open(escalation, session.escalation_dir()).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "escalation could not be opened"
                );
                let reason = format!(
                    "{} No operator could be reached ({e}), so the call was denied.",
                    evaluation.reason
                );
                return self.deny(
                    &request,
                    PolicyDecision::deny(&evaluation.rule_name, reason),
                    started,
                );
            }
        };

        let resolution = self
            .broker
            .await_resolution(ticket, self.config.escalation_timeout())
            .await;

        if resolution.is_approved() {
            if session.ensure_ready().is_err() {
                return self.deny(
                    &request,
                    PolicyDecision::deny(&evaluation.rule_name, "session closed"),
                    started,
                );
            }
            let decision = PolicyDecision::new(
                Decision::Allow,
                &evaluation.rule_name,
                format!("Approved by operator {}.", resolution.resolved_by),
            );
            return self.dispatch(session, &request, decision, started).await;
        }

        if resolution.outcome == ResolutionOutcome::TimedOut {
            METRICS.inc_escalations_timed_out();
        }
        self.deny(
            &request,
            PolicyDecision::deny(&evaluation.rule_name, resolution.deny_reason()),
            started,
        )
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("config", &self.config)
            .field("rules", &self.engine.rules().len())
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
