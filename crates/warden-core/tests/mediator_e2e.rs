use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use warden_core::escalation::ResolveOutcome;
use warden_core::metrics::METRICS;
use warden_core::{
    CallStatus, Decision, DispatchError, ErrorKind, EscalationListener, EscalationResolution,
    Fingerprint, Mediator, MediatorConfig, MediatorError, NetworkPolicy, RateLimit,
    ResolutionOutcome, SessionConfig, ToolCallRequest, ToolDispatcher, EXECUTION_MS,
    INVALID_PARAMS, TOOL_CALLS,
};

#[derive(Clone)]
enum Step {
    Return(Value),
    Err(DispatchError),
    Sleep(u64),
    /// Take `ms` of wall-clock time, then fail.
    FailAfter(u64, DispatchError),
}

#[derive(Clone)]
struct ScriptedDispatcher {
    steps: Arc<Mutex<Vec<Step>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDispatcher {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, _request: &ToolCallRequest) -> Result<Value, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut guard = self.steps.lock().await;
            if guard.is_empty() {
                Step::Return(json!({"ok": true}))
            } else {
                guard.remove(0)
            }
        };

        match step {
            Step::Return(v) => Ok(v),
            Step::Err(e) => Err(e),
            Step::Sleep(ms) => {
                sleep(Duration::from_millis(ms)).await;
                Ok(json!({"ok": true}))
            }
            Step::FailAfter(ms, e) => {
                sleep(Duration::from_millis(ms)).await;
                Err(e)
            }
        }
    }
}

fn config(state: &Path) -> MediatorConfig {
    MediatorConfig {
        resolution_poll_ms: 10,
        network: NetworkPolicy::default().with_server("fetch", ["docs.rs", "*.github.com"]),
        ..MediatorConfig::default().with_state_dir(state)
    }
}

async fn mediator_with(
    config: MediatorConfig,
    dispatcher: &ScriptedDispatcher,
    session: SessionConfig,
) -> Arc<Mediator> {
    let mediator = Mediator::with_standard_policy(config, Arc::new(dispatcher.clone()))
        .expect("mediator");
    mediator.start_session(session).await.expect("session");
    Arc::new(mediator)
}

fn delete_request() -> ToolCallRequest {
    ToolCallRequest::new("filesystem", "delete_file", json!({"path": "build/out.log"}))
}

#[tokio::test]
async fn write_outside_sandbox_is_denied_without_dispatch() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;

    let req = ToolCallRequest::new(
        "filesystem",
        "write_file",
        json!({"path": "/etc/passwd", "content": "x"}),
    )
    .with_request_id("r-1");
    let result = m.handle_tool_call("s1", req).await.unwrap();

    assert_eq!(result.request_id, "r-1");
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.status, Decision::Deny);
    assert_eq!(result.policy_decision.rule, "path_containment");
    assert_eq!(result.content, Value::String(result.policy_decision.reason.clone()));
    assert_eq!(dispatcher.call_count(), 0);

    // Traversal out of the root is caught as well.
    let req = ToolCallRequest::new(
        "filesystem",
        "read_file",
        json!({"path": "../../etc/shadow"}),
    );
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.policy_decision.rule, "path_containment");
}

#[tokio::test]
async fn allowlisted_domain_returns_dispatcher_content() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![Step::Return(json!({"body": "<html>"}))]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;

    let req = ToolCallRequest::new("fetch", "fetch", json!({"url": "https://api.github.com/x"}));
    let result = m.handle_tool_call("s1", req).await.unwrap();

    assert_eq!(result.status, CallStatus::Success);
    assert_eq!(result.content, json!({"body": "<html>"}));
    assert_eq!(result.policy_decision.rule, "domain_allowlist");
    assert_eq!(dispatcher.call_count(), 1);
}

#[tokio::test]
async fn unknown_tool_hits_default_deny() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;

    let req = ToolCallRequest::new("misc", "launch_missiles", json!({}));
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.rule, "default_deny");
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn operator_approval_through_broker_dispatches() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![Step::Return(json!({"deleted": true}))]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;
    let mut feed = m.broker().subscribe();

    let caller = m.clone();
    let call = tokio::spawn(async move { caller.handle_tool_call("s1", delete_request()).await });

    let escalation = feed.recv().await.unwrap();
    assert_eq!(escalation.rule_name, "destructive_filesystem");
    assert_eq!(escalation.session_id, "s1");
    assert_eq!(dispatcher.call_count(), 0);

    m.broker()
        .resolve(EscalationResolution::approved(
            &escalation.escalation_id,
            "alice",
            None,
        ))
        .await
        .unwrap();

    let result = call.await.unwrap().unwrap();
    assert_eq!(result.status, CallStatus::Success);
    assert_eq!(result.content, json!({"deleted": true}));
    assert_eq!(result.policy_decision.status, Decision::Allow);
    assert!(result.policy_decision.reason.contains("alice"));
    assert_eq!(dispatcher.call_count(), 1);
}

#[tokio::test]
async fn operator_rejection_denies_with_note() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;
    let mut feed = m.broker().subscribe();

    let caller = m.clone();
    let call = tokio::spawn(async move { caller.handle_tool_call("s1", delete_request()).await });
    let escalation = feed.recv().await.unwrap();
    m.broker()
        .resolve(EscalationResolution::rejected(
            &escalation.escalation_id,
            "bob",
            Some("keep the logs".into()),
        ))
        .await
        .unwrap();

    let result = call.await.unwrap().unwrap();
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.rule, "destructive_filesystem");
    assert!(result.policy_decision.reason.contains("keep the logs"));
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn listener_artifact_approval_reaches_waiting_call() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![Step::Return(json!({"deleted": true}))]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace").with_label("feature work"),
    )
    .await;

    let caller = m.clone();
    let call = tokio::spawn(async move { caller.handle_tool_call("s1", delete_request()).await });

    let mut listener = EscalationListener::start(state.path()).unwrap();
    let mut prompts = Vec::new();
    for _ in 0..200 {
        prompts = listener.poll().unwrap();
        if !prompts.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(prompts.len(), 1);
    let prompt = &prompts[0];
    assert_eq!(prompt.session_label, "feature work");
    assert_eq!(prompt.request.request.tool_name, "delete_file");

    let resolution = EscalationResolution::approved(&prompt.request.escalation_id, "carol", None);
    listener.resolve(prompt, &resolution).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call finished")
        .unwrap()
        .unwrap();
    assert_eq!(result.status, CallStatus::Success);
    assert_eq!(dispatcher.call_count(), 1);

    // Delivered once only.
    assert!(listener.poll().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn escalation_timeout_denies_and_late_answer_is_noop() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let cfg = MediatorConfig {
        escalation_timeout_secs: 2,
        ..config(state.path())
    };
    let m = mediator_with(cfg, &dispatcher, SessionConfig::new("s1", "/workspace")).await;
    let mut feed = m.broker().subscribe();

    let caller = m.clone();
    let call = tokio::spawn(async move { caller.handle_tool_call("s1", delete_request()).await });
    let escalation = feed.recv().await.unwrap();

    let result = call.await.unwrap().unwrap();
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.reason, "escalation timed out");
    assert!(METRICS.escalations_timed_out() >= 1);

    let late = m
        .broker()
        .resolve(EscalationResolution::approved(
            &escalation.escalation_id,
            "alice",
            None,
        ))
        .await
        .unwrap();
    assert!(matches!(late, ResolveOutcome::AlreadyResolved(_)));
    assert_eq!(late.resolution().outcome, ResolutionOutcome::TimedOut);
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn closing_session_denies_pending_escalation() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;
    let mut feed = m.broker().subscribe();

    let caller = m.clone();
    let call = tokio::spawn(async move { caller.handle_tool_call("s1", delete_request()).await });
    feed.recv().await.unwrap();

    m.close_session("s1").await.unwrap();
    let result = call.await.unwrap().unwrap();
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.reason, "session closed");
    assert_eq!(dispatcher.call_count(), 0);

    let err = m.handle_tool_call("s1", delete_request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
}

#[tokio::test]
async fn tool_call_budget_exhaustion_is_an_error() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace").with_budget(TOOL_CALLS, 2),
    )
    .await;

    for path in ["a.rs", "b.rs"] {
        let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": path}));
        assert!(m.handle_tool_call("s1", req).await.unwrap().is_success());
    }
    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "c.rs"}));
    let err = m.handle_tool_call("s1", req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExhausted);
    assert!(err.to_string().contains(TOOL_CALLS));
    assert_eq!(dispatcher.call_count(), 2);
}

#[tokio::test]
async fn repeated_identical_call_is_denied_as_loop() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;

    let call = || ToolCallRequest::new("filesystem", "read_file", json!({"path": "same.rs"}));
    for _ in 0..3 {
        let result = m.handle_tool_call("s1", call()).await.unwrap();
        assert_eq!(result.status, CallStatus::Success);
    }
    let result = m.handle_tool_call("s1", call()).await.unwrap();
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.rule, "repetition_guard");
    assert!(result.policy_decision.reason.contains("4 times"));
    assert_eq!(dispatcher.call_count(), 3);

    // A different call is unaffected.
    let other = ToolCallRequest::new("filesystem", "read_file", json!({"path": "other.rs"}));
    assert!(m.handle_tool_call("s1", other).await.unwrap().is_success());
}

#[tokio::test]
async fn rate_limit_denies_excess_calls() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace").with_rate_limit(RateLimit::new(2, 60)),
    )
    .await;

    for path in ["a", "b"] {
        let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": path}));
        assert!(m.handle_tool_call("s1", req).await.unwrap().is_success());
    }
    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "c"}));
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.status, CallStatus::Denied);
    assert_eq!(result.policy_decision.rule, "rate_limit");
}

#[tokio::test]
async fn dispatch_error_is_normalized() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![
        Step::Err(DispatchError::protocol(
            INVALID_PARAMS,
            "MCP error -32602: Invalid arguments for tool read_file",
            Some(json!({"content": [{"type": "text", "text": "path: expected string"}]})),
        )),
        Step::Err(DispatchError::protocol(-32000, "MCP error -32000: server crashed", None)),
    ]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;

    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "a"}));
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.status, CallStatus::Error);
    assert_eq!(result.content, json!("path: expected string"));
    assert_eq!(result.policy_decision.status, Decision::Allow);

    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "b"}));
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.content, json!("server crashed"));
}

#[tokio::test(start_paused = true)]
async fn slow_dispatch_times_out_as_error_result() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![Step::Sleep(5_000)]);
    let cfg = MediatorConfig {
        dispatch_timeout_ms: 100,
        ..config(state.path())
    };
    let m = mediator_with(cfg, &dispatcher, SessionConfig::new("s1", "/workspace")).await;

    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "a"}));
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.status, CallStatus::Error);
    assert_eq!(result.content, json!("tool call timed out after 100ms"));
}

#[tokio::test]
async fn concurrent_calls_in_one_session_do_not_block_each_other() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;
    let mut feed = m.broker().subscribe();

    // An escalated call waits...
    let caller = m.clone();
    let pending =
        tokio::spawn(async move { caller.handle_tool_call("s1", delete_request()).await });
    let escalation = feed.recv().await.unwrap();

    // ...while reads keep flowing.
    let req = ToolCallRequest::new("filesystem", "list_directory", json!({"path": "."}));
    assert!(m.handle_tool_call("s1", req).await.unwrap().is_success());
    assert!(!pending.is_finished());

    m.broker()
        .resolve(EscalationResolution::rejected(&escalation.escalation_id, "op", None))
        .await
        .unwrap();
    let result = pending.await.unwrap().unwrap();
    assert_eq!(result.status, CallStatus::Denied);
}

#[tokio::test]
async fn step_loop_detected_through_adapter() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let cfg = MediatorConfig {
        step_guard: warden_core::GuardConfig::new(2, 600),
        ..config(state.path())
    };
    let m = mediator_with(cfg, &dispatcher, SessionConfig::new("s1", "/workspace")).await;

    let event =
        |ts: u64| json!({"id": format!("evt-{ts}"), "timestamp": ts, "action": "retry build"});
    assert!(!m.record_step("s1", "generic", &event(1)).await.unwrap().is_loop());
    assert!(!m.record_step("s1", "generic", &event(2)).await.unwrap().is_loop());
    assert!(m.record_step("s1", "generic", &event(3)).await.unwrap().is_loop());

    let err = m.record_step("s1", "nope", &event(4)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownAdapter);
}

#[tokio::test]
async fn failed_dispatch_still_charges_execution_time() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![Step::FailAfter(
        80,
        DispatchError::failure("connection reset"),
    )]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace").with_budget(EXECUTION_MS, 50),
    )
    .await;

    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "a.rs"}));
    let result = m.handle_tool_call("s1", req).await.unwrap();
    assert_eq!(result.status, CallStatus::Error);
    assert_eq!(result.content, json!("connection reset"));

    let session = m.session("s1").await.unwrap();
    assert_eq!(session.budget().remaining(EXECUTION_MS), Some(0));

    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "b.rs"}));
    let err = m.handle_tool_call("s1", req).await.unwrap_err();
    assert!(
        matches!(&err, MediatorError::BudgetExhausted { dimension } if dimension == EXECUTION_MS)
    );
    assert_eq!(dispatcher.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_calls_are_counted_once_each() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace"),
    )
    .await;
    let threshold = m.config().call_guard.threshold as usize;
    let call = || ToolCallRequest::new("filesystem", "read_file", json!({"path": "same.rs"}));

    let handles: Vec<_> = (0..=threshold)
        .map(|_| {
            let m = m.clone();
            let req = call();
            tokio::spawn(async move { m.handle_tool_call("s1", req).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    let successes = results.iter().filter(|r| r.is_success()).count();
    let loops: Vec<_> = results
        .iter()
        .filter(|r| r.policy_decision.rule == "repetition_guard")
        .collect();
    assert_eq!(successes, threshold);
    assert_eq!(loops.len(), 1);
    assert!(loops[0]
        .policy_decision
        .reason
        .contains(&format!("{} times", threshold + 1)));
    assert_eq!(dispatcher.call_count(), threshold);

    let session = m.session("s1").await.unwrap();
    let fingerprint = Fingerprint::of_value(&call().fingerprint_value());
    let counter = session.call_guard().counter(&fingerprint).await.unwrap();
    assert_eq!(counter.count() as usize, threshold + 1);
    assert_eq!(session.call_guard().tracked().await, 1);
}

#[tokio::test]
async fn reset_session_reopens_exhausted_budget() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace").with_budget(TOOL_CALLS, 1),
    )
    .await;

    let req = || ToolCallRequest::new("filesystem", "read_file", json!({"path": "a.rs"}));
    assert!(m.handle_tool_call("s1", req()).await.unwrap().is_success());
    let err = m.handle_tool_call("s1", req()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExhausted);

    m.reset_session("s1").await.unwrap();
    assert!(m.handle_tool_call("s1", req()).await.unwrap().is_success());

    m.close_session("s1").await.unwrap();
    let err = m.reset_session("s1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
}

#[tokio::test]
async fn consumed_usage_exhausts_its_dimension() {
    let state = tempfile::tempdir().unwrap();
    let dispatcher = ScriptedDispatcher::new(vec![]);
    let m = mediator_with(
        config(state.path()),
        &dispatcher,
        SessionConfig::new("s1", "/workspace").with_budget("tokens", 1_000),
    )
    .await;

    assert_eq!(m.consume_budget("s1", "tokens", 600).await.unwrap(), Some(400));
    let err = m.consume_budget("s1", "tokens", 500).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BudgetExhausted);
    assert_eq!(m.consume_budget("s1", "other", 5).await.unwrap(), None);
    assert_eq!(m.consume_budget("s1", "tokens", 400).await.unwrap(), Some(0));

    let req = ToolCallRequest::new("filesystem", "read_file", json!({"path": "a.rs"}));
    let err = m.handle_tool_call("s1", req).await.unwrap_err();
    assert!(err.to_string().contains("tokens"));
    assert_eq!(dispatcher.call_count(), 0);
}
