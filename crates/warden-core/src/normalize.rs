//! Dispatch error normalization.
//!
//! Tool servers fail in different shapes: JSON-RPC style protocol errors
//! (with or without structured `data`), plain failures, or arbitrary values.
//! The agent should see one clean message regardless.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC "invalid params" code; its `data` usually carries the real cause.
pub const INVALID_PARAMS: i64 = -32602;

/// A failure reported while dispatching a call to a tool server.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// Protocol-level error with a numeric code.
    #[error("{message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Transport or server failure with a message.
    #[error("{0}")]
    Failure(String),

    /// Anything else the server sent back.
    #[error("{0}")]
    Opaque(Value),
}

impl DispatchError {
    pub fn protocol(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Failure(format!("tool call timed out after {timeout_ms}ms"))
    }
}

fn protocol_prefix() -> Option<&'static Regex> {
    static PREFIX: OnceLock<Option<Regex>> = OnceLock::new();
    PREFIX
        .get_or_init(|| Regex::new(r"^MCP error -?\d+:\s*").ok())
        .as_ref()
}

fn strip_protocol_prefix(message: &str) -> String {
    match protocol_prefix() {
        Some(prefix) => prefix.replace(message, "").into_owned(),
        None => message.to_string(),
    }
}

/// First human-readable message inside invalid-params `data`.
fn data_message(data: &Value) -> Option<String> {
    if let Some(parsed) = data.as_str().and_then(|s| serde_json::from_str::<Value>(s).ok()) {
        if parsed.is_object() {
            return data_message(&parsed);
        }
    }
    for key in ["message", "error"] {
        if let Some(text) = data.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    data.get("content")
        .and_then(Value::as_array)?
        .iter()
        .find(|entry| entry.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|entry| entry.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Map a dispatch failure to the single message the agent receives.
///
/// Never fails: the fallback is the error's own string form.
pub fn normalize_dispatch_error(error: &DispatchError) -> String {
    match error {
        DispatchError::Protocol {
            code: INVALID_PARAMS,
            data: Some(data),
            message,
        } => data_message(data).unwrap_or_else(|| strip_protocol_prefix(message)),
        DispatchError::Protocol { message, .. } => strip_protocol_prefix(message),
        DispatchError::Failure(message) => strip_protocol_prefix(message),
        DispatchError::Opaque(Value::String(text)) => text.clone(),
        DispatchError::Opaque(value) => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    }
}
