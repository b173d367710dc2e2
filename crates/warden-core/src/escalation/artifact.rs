//! Request and resolution artifacts exchanged with the operator.
//!
//! Requests are written atomically (temp file + rename). Resolutions are
//! published with a hard link from a fully written temp file, which fails if
//! the target exists: the first resolution written wins and later writers get
//! the existing one back.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::request::ToolCallRequest;

use super::error::{EscalationError, EscalationResult};
use super::{
    is_file_safe_id, request_path, resolution_path, temp_sibling, write_atomic, REQUEST_SUFFIX,
};

/// A call awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub escalation_id: String,
    pub session_id: String,
    /// Rule that escalated the call, and its reason.
    pub rule_name: String,
    pub reason: String,
    pub request: ToolCallRequest,
    pub created_at: DateTime<Utc>,
}

impl EscalationRequest {
    pub fn new(
        session_id: impl Into<String>,
        request: ToolCallRequest,
        rule_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            escalation_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            rule_name: rule_name.into(),
            reason: reason.into(),
            request,
            created_at: Utc::now(),
        }
    }
}

/// Terminal outcome of an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl ResolutionOutcome {
    pub fn is_approved(self) -> bool {
        self == ResolutionOutcome::Approved
    }
}

impl std::fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionOutcome::Approved => "approved",
            ResolutionOutcome::Rejected => "rejected",
            ResolutionOutcome::TimedOut => "timed_out",
            ResolutionOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The decision on one escalation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationResolution {
    pub escalation_id: String,
    pub outcome: ResolutionOutcome,
    /// Who resolved it: an operator name, or `warden` for automatic outcomes.
    pub resolved_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl EscalationResolution {
    fn new(
        escalation_id: &str,
        outcome: ResolutionOutcome,
        resolved_by: &str,
        note: Option<String>,
    ) -> Self {
        Self {
            escalation_id: escalation_id.to_string(),
            outcome,
            resolved_by: resolved_by.to_string(),
            note,
            resolved_at: Utc::now(),
        }
    }

    pub fn approved(escalation_id: &str, operator: &str, note: Option<String>) -> Self {
        Self::new(escalation_id, ResolutionOutcome::Approved, operator, note)
    }

    pub fn rejected(escalation_id: &str, operator: &str, note: Option<String>) -> Self {
        Self::new(escalation_id, ResolutionOutcome::Rejected, operator, note)
    }

    pub fn timed_out(escalation_id: &str) -> Self {
        Self::new(escalation_id, ResolutionOutcome::TimedOut, "warden", None)
    }

    pub fn cancelled(escalation_id: &str, reason: &str) -> Self {
        Self::new(
            escalation_id,
            ResolutionOutcome::Cancelled,
            "warden",
            Some(reason.to_string()),
        )
    }

    pub fn is_approved(&self) -> bool {
        self.outcome.is_approved()
    }

    /// Reason delivered to the agent when the outcome is not an approval.
    pub fn deny_reason(&self) -> String {
        match (self.outcome, self.note.as_deref()) {
            (ResolutionOutcome::TimedOut, _) => "escalation timed out".to_string(),
            (ResolutionOutcome::Cancelled, Some(note)) => note.to_string(),
            (ResolutionOutcome::Cancelled, None) => "session closed".to_string(),
            (_, Some(note)) if !note.trim().is_empty() => {
                format!("The operator rejected this call: {note}")
            }
            _ => "The operator rejected this call. Try a less destructive alternative."
                .to_string(),
        }
    }
}

/// Result of publishing a resolution artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Another resolution was already in place; it is returned unchanged.
    AlreadyResolved(EscalationResolution),
}

impl WriteOutcome {
    /// The resolution now in effect, given the one we tried to write.
    pub fn effective(self, attempted: EscalationResolution) -> EscalationResolution {
        match self {
            WriteOutcome::Written => attempted,
            WriteOutcome::AlreadyResolved(existing) => existing,
        }
    }
}

pub fn write_request(escalation_dir: &Path, request: &EscalationRequest) -> EscalationResult<()> {
    if !is_file_safe_id(&request.escalation_id) {
        return Err(EscalationError::InvalidId(request.escalation_id.clone()));
    }
    std::fs::create_dir_all(escalation_dir)?;
    let json = serde_json::to_vec_pretty(request)?;
    write_atomic(&request_path(escalation_dir, &request.escalation_id), &json)?;
    Ok(())
}

pub fn read_request(path: &Path) -> EscalationResult<EscalationRequest> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Publish a resolution unless one already exists.
pub fn write_resolution(
    escalation_dir: &Path,
    resolution: &EscalationResolution,
) -> EscalationResult<WriteOutcome> {
    if !is_file_safe_id(&resolution.escalation_id) {
        return Err(EscalationError::InvalidId(resolution.escalation_id.clone()));
    }
    std::fs::create_dir_all(escalation_dir)?;
    let target = resolution_path(escalation_dir, &resolution.escalation_id);
    let tmp = temp_sibling(&target);
    std::fs::write(&tmp, serde_json::to_vec_pretty(resolution)?)?;
    let linked = std::fs::hard_link(&tmp, &target);
    let _ = std::fs::remove_file(&tmp);

    match linked {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = read_resolution(escalation_dir, &resolution.escalation_id)?
                .ok_or_else(|| {
                    EscalationError::UnknownEscalation(resolution.escalation_id.clone())
                })?;
            Ok(WriteOutcome::AlreadyResolved(existing))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn read_resolution(
    escalation_dir: &Path,
    escalation_id: &str,
) -> EscalationResult<Option<EscalationResolution>> {
    match std::fs::read_to_string(resolution_path(escalation_dir, escalation_id)) {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Requests in `escalation_dir` that have no resolution yet, oldest first.
pub fn pending_requests(escalation_dir: &Path) -> EscalationResult<Vec<EscalationRequest>> {
    let entries = match std::fs::read_dir(escalation_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut pending = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = name.strip_suffix(REQUEST_SUFFIX) else {
            continue;
        };
        if id.starts_with('.') || resolution_path(escalation_dir, id).exists() {
            continue;
        }
        match read_request(&path) {
            Ok(request) => pending.push(request),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "skipping unreadable escalation request"
            ),
        }
    }
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> EscalationRequest {
        EscalationRequest::new(
            "s1",
            ToolCallRequest::new("fs", "delete_file", json!({"path": "old.txt"})),
            "destructive_filesystem",
            "needs approval",
        )
    }

    #[test]
    fn test_request_then_pending() {
        let dir = tempfile::tempdir().unwrap();
        let request = sample_request();
        write_request(dir.path(), &request).unwrap();

        let pending = pending_requests(dir.path()).unwrap();
        assert_eq!(pending, vec![request.clone()]);

        let resolution = EscalationResolution::approved(&request.escalation_id, "alice", None);
        write_resolution(dir.path(), &resolution).unwrap();
        assert!(pending_requests(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_first_resolution_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = EscalationResolution::approved("e1", "alice", None);
        let second = EscalationResolution::rejected("e1", "bob", Some("no".into()));

        assert_eq!(write_resolution(dir.path(), &first).unwrap(), WriteOutcome::Written);
        let outcome = write_resolution(dir.path(), &second).unwrap();
        assert_eq!(outcome, WriteOutcome::AlreadyResolved(first.clone()));
        assert_eq!(read_resolution(dir.path(), "e1").unwrap(), Some(first.clone()));
        assert_eq!(outcome.effective(second), first);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let resolution = EscalationResolution::timed_out("e1");
        write_resolution(dir.path(), &resolution).unwrap();
        write_resolution(dir.path(), &resolution).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["e1.resolution.json".to_string()]);
    }

    #[test]
    fn test_read_missing_resolution() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_resolution(dir.path(), "nope").unwrap(), None);
        assert!(pending_requests(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn test_deny_reasons() {
        assert_eq!(
            EscalationResolution::timed_out("e").deny_reason(),
            "escalation timed out"
        );
        assert_eq!(
            EscalationResolution::cancelled("e", "session closed").deny_reason(),
            "session closed"
        );
        assert!(EscalationResolution::rejected("e", "op", Some("too risky".into()))
            .deny_reason()
            .contains("too risky"));
        assert!(!EscalationResolution::rejected("e", "op", None).is_approved());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resolution = EscalationResolution::approved("../x", "op", None);
        assert!(matches!(
            write_resolution(dir.path(), &resolution),
            Err(EscalationError::InvalidId(_))
        ));
    }
}
