//! Policy evaluation engine: first-match-wins, default-deny.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::request::{Decision, PolicyDecision, ToolCallRequest};

use super::error::{PolicyError, PolicyResult};
use super::rule::{PolicyRule, DEFAULT_RULE_NAME};

/// The outcome of one evaluation. Exactly one rule is credited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub decision: Decision,
    pub rule_name: String,
    pub reason: String,
}

impl EvaluationResult {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn to_policy_decision(&self) -> PolicyDecision {
        PolicyDecision::new(self.decision, &self.rule_name, &self.reason)
    }
}

/// An ordered, validated rule set.
///
/// The last rule is always an unconditional deny: if the supplied rules do
/// not end with one, [`PolicyRule::default_deny`] is appended. Unconditional
/// allow rules are rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    /// Build an engine from rules in registration order.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::DuplicateRule` when two rules share a name,
    /// `PolicyError::UnnamedRule` for an empty name,
    /// `PolicyError::MissingReason` for an empty reason and
    /// `PolicyError::UnconditionalAllow` for an allow rule without a condition.
    pub fn new(mut rules: Vec<PolicyRule>) -> PolicyResult<Self> {
        let mut seen = HashSet::new();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(PolicyError::UnnamedRule(idx));
            }
            if rule.reason.trim().is_empty() {
                return Err(PolicyError::MissingReason(rule.name.clone()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(PolicyError::DuplicateRule(rule.name.clone()));
            }
            if rule.decision == Decision::Allow && rule.condition.is_unconditional() {
                return Err(PolicyError::UnconditionalAllow(rule.name.clone()));
            }
        }

        let terminated = rules.last().is_some_and(|rule| {
            rule.decision == Decision::Deny && rule.condition.is_unconditional()
        });
        if !terminated {
            if seen.contains(DEFAULT_RULE_NAME) {
                return Err(PolicyError::DuplicateRule(DEFAULT_RULE_NAME.to_string()));
            }
            rules.push(PolicyRule::default_deny());
        }

        Ok(Self { rules })
    }

    /// An engine with only the default rule: everything is denied.
    pub fn deny_all() -> Self {
        Self {
            rules: vec![PolicyRule::default_deny()],
        }
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Evaluate a request against the rule set.
    ///
    /// Rules are checked in order; the first whose condition holds decides.
    /// The terminating unconditional rule guarantees a result.
    pub fn evaluate(&self, request: &ToolCallRequest, sandbox_root: &Path) -> EvaluationResult {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.matches(request, sandbox_root));

        match rule {
            Some(rule) => EvaluationResult {
                decision: rule.decision,
                rule_name: rule.name.clone(),
                reason: rule.reason.clone(),
            },
            // Unreachable while the constructor invariant holds; still fail closed.
            None => {
                let fallback = PolicyRule::default_deny();
                EvaluationResult {
                    decision: fallback.decision,
                    rule_name: fallback.name,
                    reason: fallback.reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::condition::Condition;

    fn make_request(tool: &str) -> ToolCallRequest {
        ToolCallRequest::new("test_server", tool, serde_json::json!({}))
    }

    #[test]
    fn test_default_deny_when_no_rules() {
        let engine = PolicyEngine::new(Vec::new()).unwrap();
        let result = engine.evaluate(&make_request("anything"), Path::new("/w"));
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.rule_name, DEFAULT_RULE_NAME);
    }

    #[test]
    fn test_first_match_wins() {
        let engine = PolicyEngine::new(vec![
            PolicyRule::allow("r1", Condition::tool_is(["x"]), "first"),
            PolicyRule::deny("r2", Condition::tool_is(["x"]), "second"),
        ])
        .unwrap();
        let result = engine.evaluate(&make_request("x"), Path::new("/w"));
        assert_eq!(result.decision, Decision::Allow);
        assert_eq!(result.rule_name, "r1");
        assert_eq!(result.reason, "first");
    }

    #[test]
    fn test_unconditional_deny_terminates_without_default() {
        let engine =
            PolicyEngine::new(vec![PolicyRule::deny("closed", Condition::Always, "no")]).unwrap();
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.rules()[0].name, "closed");
    }

    #[test]
    fn test_unconditional_allow_rejected() {
        let err = PolicyEngine::new(vec![PolicyRule::allow("open", Condition::Always, "all")])
            .unwrap_err();
        assert_eq!(err, PolicyError::UnconditionalAllow("open".into()));

        let err = PolicyEngine::new(vec![
            PolicyRule::deny("reads", Condition::tool_is(["read_file"]), "no"),
            PolicyRule::allow("rest", Condition::Always, "all"),
        ])
        .unwrap_err();
        assert_eq!(err, PolicyError::UnconditionalAllow("rest".into()));
    }

    #[test]
    fn test_unconditional_escalate_still_gets_default_deny() {
        let engine = PolicyEngine::new(vec![PolicyRule::escalate(
            "ask",
            Condition::Always,
            "ask the operator",
        )])
        .unwrap();
        assert_eq!(engine.rules().len(), 2);
        assert_eq!(engine.rules()[1].name, DEFAULT_RULE_NAME);
    }

    #[test]
    fn test_default_appended_after_conditional_rules() {
        let engine = PolicyEngine::new(vec![PolicyRule::allow(
            "reads",
            Condition::tool_is(["read_file"]),
            "ok",
        )])
        .unwrap();
        assert_eq!(engine.rules().len(), 2);
        assert_eq!(engine.rules()[1].name, DEFAULT_RULE_NAME);

        let result = engine.evaluate(&make_request("write_file"), Path::new("/w"));
        assert_eq!(result.rule_name, DEFAULT_RULE_NAME);
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let err = PolicyEngine::new(vec![
            PolicyRule::allow("dup", Condition::tool_is(["a"]), "x"),
            PolicyRule::deny("dup", Condition::tool_is(["b"]), "y"),
        ])
        .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateRule("dup".into()));
    }

    #[test]
    fn test_conditional_rule_named_default_deny_rejected() {
        let err = PolicyEngine::new(vec![PolicyRule::allow(
            DEFAULT_RULE_NAME,
            Condition::tool_is(["a"]),
            "x",
        )])
        .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateRule(DEFAULT_RULE_NAME.into()));
    }

    #[test]
    fn test_unnamed_and_reasonless_rules_rejected() {
        let err = PolicyEngine::new(vec![PolicyRule::deny(" ", Condition::Always, "x")])
            .unwrap_err();
        assert_eq!(err, PolicyError::UnnamedRule(0));

        let err =
            PolicyEngine::new(vec![PolicyRule::deny("r", Condition::Always, "")]).unwrap_err();
        assert_eq!(err, PolicyError::MissingReason("r".into()));
    }

    #[test]
    fn test_escalate_verdict() {
        let engine = PolicyEngine::new(vec![PolicyRule::escalate(
            "deletes",
            Condition::tool_is(["delete_file"]),
            "needs approval",
        )])
        .unwrap();
        let result = engine.evaluate(&make_request("delete_file"), Path::new("/w"));
        assert_eq!(result.decision, Decision::Escalate);
        assert!(!result.is_allowed());
        assert_eq!(result.to_policy_decision().rule, "deletes");
    }

    #[test]
    fn test_deny_all_engine() {
        let engine = PolicyEngine::deny_all();
        let result = engine.evaluate(&make_request("read_file"), Path::new("/w"));
        assert_eq!(result.decision, Decision::Deny);
    }
}
