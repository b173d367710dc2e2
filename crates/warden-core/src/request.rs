//! Tool call request and result types exchanged across the sandbox boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// String-keyed tool arguments, exactly as the agent supplied them.
pub type Arguments = Map<String, Value>;

/// A single agent-initiated tool call. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Caller-chosen identifier echoed back in the result.
    pub request_id: String,
    /// Tool server the call is addressed to (e.g. "filesystem").
    pub server_name: String,
    /// Tool name on that server (e.g. "write_file").
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRequest {
    /// Build a request with a fresh id and the current timestamp.
    ///
    /// Non-object `arguments` are treated as an empty argument map.
    pub fn new(
        server_name: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            arguments,
            timestamp: Utc::now(),
        }
    }

    /// Replace the generated request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn argument_str(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    /// Check the request shape. Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_id.trim().is_empty() {
            return Err("request_id must not be empty".into());
        }
        if self.server_name.trim().is_empty() {
            return Err("server_name must not be empty".into());
        }
        if self.tool_name.trim().is_empty() {
            return Err("tool_name must not be empty".into());
        }
        Ok(())
    }

    /// The value fingerprinted by the call-level repetition guard:
    /// tool name plus arguments. Request id and timestamp are excluded so
    /// that re-issued identical calls collide.
    pub fn fingerprint_value(&self) -> Value {
        serde_json::json!({
            "tool": self.tool_name,
            "arguments": Value::Object(self.arguments.clone()),
        })
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    Escalate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Deny => write!(f, "deny"),
            Decision::Escalate => write!(f, "escalate"),
        }
    }
}

/// The decision embedded in every [`ToolCallResult`].
///
/// `rule` is the machine-readable identifier of the rule (or guard) that
/// decided; `reason` is corrective guidance delivered verbatim to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub status: Decision,
    pub rule: String,
    pub reason: String,
}

impl PolicyDecision {
    pub fn new(status: Decision, rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status,
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    pub fn deny(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(Decision::Deny, rule, reason)
    }
}

/// Terminal status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Denied,
    Error,
}

/// Terminal, immutable record returned to the agent for every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub request_id: String,
    pub status: CallStatus,
    /// Dispatcher content on success, the denial reason on `denied`,
    /// the normalized error message on `error`.
    pub content: Value,
    pub policy_decision: PolicyDecision,
    pub duration_ms: u64,
}

impl ToolCallResult {
    pub fn success(
        request_id: &str,
        content: Value,
        decision: PolicyDecision,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: CallStatus::Success,
            content,
            policy_decision: decision,
            duration_ms,
        }
    }

    pub fn denied(request_id: &str, decision: PolicyDecision, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: CallStatus::Denied,
            content: Value::String(decision.reason.clone()),
            policy_decision: decision,
            duration_ms,
        }
    }

    pub fn error(
        request_id: &str,
        message: String,
        decision: PolicyDecision,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: CallStatus::Error,
            content: Value::String(message),
            policy_decision: decision,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }
}
