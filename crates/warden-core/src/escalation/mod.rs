//! Escalation channel: routes `escalate` decisions to a human operator.
//!
//! Two halves cooperate through the filesystem and, in-process, through
//! channels:
//!
//! - The mediator side ([`EscalationBroker`]) writes a request artifact per
//!   escalation and suspends only the issuing call on a oneshot channel.
//! - The operator side ([`EscalationListener`]) is a host-wide singleton,
//!   enforced by an advisory lock. It discovers live sessions through their
//!   [`EscalationRecord`]s, presents new requests and writes back resolution
//!   artifacts. A [`ResolutionWatcher`] bridges those artifacts into the
//!   broker.
//!
//! Layout under the state directory:
//!
//! ```text
//! <state_dir>/listener.lock
//! <state_dir>/sessions/<session_id>.json
//! <escalation_dir>/<escalation_id>.request.json
//! <escalation_dir>/<escalation_id>.resolution.json
//! ```
//!
//! # Modules
//!
//! - [`record`]: `EscalationRecord` session registration
//! - [`artifact`]: request / resolution documents, first-resolution-wins writes
//! - [`lock`]: `ListenerLock` (`flock`, embedded owner pid, stale detection)
//! - [`broker`]: in-process hand-off, timeouts, cancellation
//! - [`watcher`]: resolution artifact bridge
//! - [`listener`]: operator-side polling with exactly-once delivery
//! - [`error`]: `EscalationError` / `EscalationResult`

pub mod artifact;
pub mod broker;
pub mod error;
pub mod listener;
pub mod lock;
pub mod record;
pub mod watcher;

use std::path::{Path, PathBuf};

pub use artifact::{
    pending_requests, read_resolution, write_request, write_resolution, EscalationRequest,
    EscalationResolution, ResolutionOutcome, WriteOutcome,
};
pub use broker::{EscalationBroker, EscalationTicket, ResolveOutcome};
pub use error::{EscalationError, EscalationResult};
pub use listener::{EscalationListener, PendingPrompt};
pub use lock::{inspect_lock, pid_alive, ListenerLock, ListenerLockInfo, LockStatus};
pub use record::{list_sessions, EscalationRecord};
pub use watcher::ResolutionWatcher;

const SESSIONS_DIR: &str = "sessions";
const ESCALATIONS_DIR: &str = "escalations";
const LOCK_FILE: &str = "listener.lock";
const REQUEST_SUFFIX: &str = ".request.json";
const RESOLUTION_SUFFIX: &str = ".resolution.json";

pub fn sessions_dir(state_dir: &Path) -> PathBuf {
    state_dir.join(SESSIONS_DIR)
}

pub fn session_record_path(state_dir: &Path, session_id: &str) -> PathBuf {
    sessions_dir(state_dir).join(format!("{session_id}.json"))
}

/// Default escalation directory for a session that does not configure one.
pub fn default_escalation_dir(state_dir: &Path, session_id: &str) -> PathBuf {
    state_dir.join(ESCALATIONS_DIR).join(session_id)
}

pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

pub fn request_path(escalation_dir: &Path, escalation_id: &str) -> PathBuf {
    escalation_dir.join(format!("{escalation_id}{REQUEST_SUFFIX}"))
}

pub fn resolution_path(escalation_dir: &Path, escalation_id: &str) -> PathBuf {
    escalation_dir.join(format!("{escalation_id}{RESOLUTION_SUFFIX}"))
}

/// Identifiers become file names: no separators, no dot-only names.
pub fn is_file_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Write `bytes` to `path` via a temporary sibling and a rename, so readers
/// never observe a partial document.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}
