//! Policy rules.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::request::{Decision, ToolCallRequest};

use super::condition::Condition;

/// Name of the catch-all rule that makes every evaluation fail closed.
pub const DEFAULT_RULE_NAME: &str = "default_deny";

/// A named, immutable rule: when `condition` holds, the rule yields `decision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub condition: Condition,
    pub decision: Decision,
    /// Delivered verbatim to the agent; should say what was refused and
    /// point at an alternative.
    pub reason: String,
}

impl PolicyRule {
    pub fn new(
        name: impl Into<String>,
        decision: Decision,
        condition: Condition,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            condition,
            decision,
            reason: reason.into(),
        }
    }

    pub fn allow(name: impl Into<String>, condition: Condition, reason: impl Into<String>) -> Self {
        Self::new(name, Decision::Allow, condition, reason)
    }

    pub fn deny(name: impl Into<String>, condition: Condition, reason: impl Into<String>) -> Self {
        Self::new(name, Decision::Deny, condition, reason)
    }

    pub fn escalate(
        name: impl Into<String>,
        condition: Condition,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(name, Decision::Escalate, condition, reason)
    }

    /// Attach a human-readable description (builder pattern).
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The catch-all fail-closed rule.
    pub fn default_deny() -> Self {
        Self::deny(
            DEFAULT_RULE_NAME,
            Condition::Always,
            "No policy rule permits this tool call, so it was denied. \
             Use a permitted tool or ask the operator to extend the policy.",
        )
        .describe("Catch-all: anything not explicitly allowed is denied")
    }

    pub fn matches(&self, request: &ToolCallRequest, sandbox_root: &Path) -> bool {
        self.condition.holds(request, sandbox_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_deny_is_unconditional() {
        let rule = PolicyRule::default_deny();
        assert_eq!(rule.name, DEFAULT_RULE_NAME);
        assert_eq!(rule.decision, Decision::Deny);
        assert!(rule.condition.is_unconditional());
        let req = ToolCallRequest::new("any", "anything", serde_json::json!({}));
        assert!(rule.matches(&req, Path::new("/")));
    }

    #[test]
    fn test_rule_matches_via_condition() {
        let rule = PolicyRule::allow("reads", Condition::tool_is(["read_file"]), "ok");
        let read = ToolCallRequest::new("fs", "read_file", serde_json::json!({}));
        let write = ToolCallRequest::new("fs", "write_file", serde_json::json!({}));
        assert!(rule.matches(&read, Path::new("/w")));
        assert!(!rule.matches(&write, Path::new("/w")));
    }

    #[test]
    fn test_rule_serde_roundtrip() {
        let rule = PolicyRule::escalate("destructive", Condition::tool_is(["delete_file"]), "ask")
            .describe("deletes need a human");
        let json = serde_json::to_string(&rule).unwrap();
        let back: PolicyRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, back);
    }
}
