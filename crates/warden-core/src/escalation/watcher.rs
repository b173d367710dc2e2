//! Bridges resolution artifacts written by the out-of-process listener into
//! the in-process broker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::artifact::read_resolution;
use super::broker::EscalationBroker;

/// Background task polling one session's escalation directory. Stops on drop.
#[derive(Debug)]
pub struct ResolutionWatcher {
    handle: JoinHandle<()>,
}

impl ResolutionWatcher {
    /// Spawn the watcher on the current tokio runtime.
    pub fn spawn(
        broker: Arc<EscalationBroker>,
        session_id: String,
        escalation_dir: PathBuf,
        poll: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&broker, &session_id, &escalation_dir).await;
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for ResolutionWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Apply every resolution artifact that exists for a pending escalation.
/// Returns how many were applied.
pub async fn sweep(broker: &EscalationBroker, session_id: &str, escalation_dir: &Path) -> usize {
    let mut applied = 0;
    for id in broker.pending_ids(Some(session_id)).await {
        match read_resolution(escalation_dir, &id) {
            Ok(Some(resolution)) => {
                debug!(
                    escalation_id = %id,
                    outcome = %resolution.outcome,
                    "resolution artifact found"
                );
                // Losing a race with a timeout or cancellation is fine.
                if broker.resolve(resolution).await.is_ok() {
                    applied += 1;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(escalation_id = %id, error = %e, "unreadable resolution artifact"),
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::artifact::{
        write_resolution, EscalationRequest, EscalationResolution, ResolutionOutcome,
    };
    use crate::request::ToolCallRequest;
    use serde_json::json;

    fn request() -> EscalationRequest {
        EscalationRequest::new(
            "s1",
            ToolCallRequest::new("fs", "delete_file", json!({"path": "a"})),
            "destructive_filesystem",
            "needs approval",
        )
    }

    #[tokio::test]
    async fn test_sweep_applies_listener_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let broker = EscalationBroker::new();
        let ticket = broker.open(request(), dir.path()).await.unwrap();
        assert_eq!(sweep(&broker, "s1", dir.path()).await, 0);

        write_resolution(
            dir.path(),
            &EscalationResolution::rejected(&ticket.escalation_id, "alice", None),
        )
        .unwrap();
        assert_eq!(sweep(&broker, "s1", dir.path()).await, 1);
        let resolution = broker
            .await_resolution(ticket, Duration::from_secs(1))
            .await;
        assert_eq!(resolution.outcome, ResolutionOutcome::Rejected);
        // Nothing left to apply.
        assert_eq!(sweep(&broker, "s1", dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_spawned_watcher_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(EscalationBroker::new());
        let ticket = broker.open(request(), dir.path()).await.unwrap();
        let watcher = ResolutionWatcher::spawn(
            broker.clone(),
            "s1".into(),
            dir.path().to_path_buf(),
            Duration::from_millis(10),
        );
        write_resolution(
            dir.path(),
            &EscalationResolution::approved(&ticket.escalation_id, "alice", None),
        )
        .unwrap();
        let resolution = broker
            .await_resolution(ticket, Duration::from_secs(5))
            .await;
        assert!(resolution.is_approved());
        watcher.stop();
    }
}
