//! Terminal rendering and answer parsing for operator prompts.

use warden_core::{EscalationResolution, PendingPrompt};

/// What the operator typed at the decision prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Approve,
    Deny,
}

pub fn parse_answer(line: &str) -> Option<Answer> {
    match line.trim().to_ascii_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => Some(Answer::Approve),
        "d" | "deny" | "n" | "no" | "reject" => Some(Answer::Deny),
        _ => None,
    }
}

pub fn render(prompt: &PendingPrompt) -> String {
    let request = &prompt.request;
    let session = if prompt.session_label.is_empty() {
        prompt.session_id.clone()
    } else {
        format!("{} ({})", prompt.session_id, prompt.session_label)
    };
    let arguments = serde_json::to_string_pretty(&request.request.arguments)
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "\n=== escalation {} ===\n\
         session: {session}\n\
         tool:    {}/{}\n\
         rule:    {}\n\
         reason:  {}\n\
         arguments:\n{arguments}\n",
        request.escalation_id,
        request.request.server_name,
        request.request.tool_name,
        request.rule_name,
        request.reason,
    )
}

pub fn resolution(
    prompt: &PendingPrompt,
    answer: Answer,
    operator: &str,
    note: &str,
) -> EscalationResolution {
    let note = Some(note.trim().to_string()).filter(|n| !n.is_empty());
    let id = &prompt.request.escalation_id;
    match answer {
        Answer::Approve => EscalationResolution::approved(id, operator, note),
        Answer::Deny => EscalationResolution::rejected(id, operator, note),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use warden_core::{EscalationRequest, ResolutionOutcome, ToolCallRequest};

    fn prompt(label: &str) -> PendingPrompt {
        PendingPrompt {
            session_id: "s1".into(),
            session_label: label.into(),
            escalation_dir: PathBuf::from("/tmp/esc"),
            request: EscalationRequest::new(
                "s1",
                ToolCallRequest::new("filesystem", "delete_file", json!({"path": "a.txt"})),
                "destructive_filesystem",
                "needs approval",
            ),
        }
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer(" Approve\n"), Some(Answer::Approve));
        assert_eq!(parse_answer("y"), Some(Answer::Approve));
        assert_eq!(parse_answer("deny"), Some(Answer::Deny));
        assert_eq!(parse_answer("N"), Some(Answer::Deny));
        assert_eq!(parse_answer("maybe"), None);
        assert_eq!(parse_answer(""), None);
    }

    #[test]
    fn test_render_shows_call_details() {
        let text = render(&prompt("refactor"));
        assert!(text.contains("s1 (refactor)"));
        assert!(text.contains("filesystem/delete_file"));
        assert!(text.contains("destructive_filesystem"));
        assert!(text.contains("a.txt"));
        assert!(render(&prompt("")).contains("session: s1\n"));
    }

    #[test]
    fn test_resolution_note_is_optional() {
        let p = prompt("");
        let approved = resolution(&p, Answer::Approve, "alice", "  ");
        assert_eq!(approved.outcome, ResolutionOutcome::Approved);
        assert_eq!(approved.note, None);

        let denied = resolution(&p, Answer::Deny, "alice", "use git rm instead");
        assert_eq!(denied.outcome, ResolutionOutcome::Rejected);
        assert_eq!(denied.resolved_by, "alice");
        assert_eq!(denied.note.as_deref(), Some("use git rm instead"));
    }
}
