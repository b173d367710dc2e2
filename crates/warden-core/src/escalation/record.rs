//! Session registration for the escalation listener.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{EscalationError, EscalationResult};
use super::{is_file_safe_id, session_record_path, sessions_dir, write_atomic};

/// One per live session. Written at session start, removed at session end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    pub session_id: String,
    /// Absolute path of the directory holding this session's artifacts.
    pub escalation_dir: PathBuf,
    pub label: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "ownerProcessId")]
    pub owner_pid: u32,
}

impl EscalationRecord {
    /// A record owned by the current process, started now.
    pub fn new(
        session_id: impl Into<String>,
        escalation_dir: impl Into<PathBuf>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            escalation_dir: escalation_dir.into(),
            label: label.into(),
            started_at: Utc::now(),
            owner_pid: std::process::id(),
        }
    }

    /// Write the record under `<state_dir>/sessions/` and return its path.
    pub fn register(&self, state_dir: &Path) -> EscalationResult<PathBuf> {
        if !is_file_safe_id(&self.session_id) {
            return Err(EscalationError::InvalidId(self.session_id.clone()));
        }
        std::fs::create_dir_all(sessions_dir(state_dir))?;
        let path = session_record_path(state_dir, &self.session_id);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Remove a session's record. Returns `false` if it was already gone.
    pub fn deregister(state_dir: &Path, session_id: &str) -> EscalationResult<bool> {
        match std::fs::remove_file(session_record_path(state_dir, session_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(path: &Path) -> EscalationResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// All registered sessions, oldest first. Unreadable records are skipped.
pub fn list_sessions(state_dir: &Path) -> EscalationResult<Vec<EscalationRecord>> {
    let dir = sessions_dir(state_dir);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match EscalationRecord::load(&path) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable session record")
            }
        }
    }
    records.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    Ok(records)
}
