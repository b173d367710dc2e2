//! Agent adapters: reduce raw agent output events to step summaries.
//!
//! Step-level loop detection fingerprints what the agent *did* in a step, not
//! the raw event, which carries ids and timestamps that differ every time.
//! Each agent family gets an adapter; adapters are registered explicitly at
//! startup under a unique key.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::error::{MediatorError, MediatorResult};

/// Keys dropped by [`GenericAdapter`] at every nesting level.
const VOLATILE_KEYS: &[&str] = &[
    "id",
    "uuid",
    "request_id",
    "message_id",
    "session_id",
    "parent_tool_use_id",
    "tool_use_id",
    "timestamp",
    "ts",
    "time",
    "created_at",
    "duration_ms",
    "usage",
];

pub trait AgentAdapter: Send + Sync + 'static {
    /// Registry key, e.g. `"generic"`.
    fn name(&self) -> &str;

    /// Summarize one raw event. `None` means the event is not an agent step
    /// (system notices, final results) and is not fingerprinted.
    fn summarize_step(&self, event: &Value) -> Option<Value>;
}

/// Works for any JSON event: strips volatile keys, keeps the rest.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericAdapter;

impl GenericAdapter {
    fn strip(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !VOLATILE_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), Self::strip(v)))
                    .collect::<Map<String, Value>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(Self::strip).collect()),
            other => other.clone(),
        }
    }
}

impl AgentAdapter for GenericAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn summarize_step(&self, event: &Value) -> Option<Value> {
        match event {
            Value::Null => None,
            other => Some(Self::strip(other)),
        }
    }
}

/// Stream-JSON agents emit one `{"type": "assistant", "message": {...}}`
/// event per step, with `tool_use` and `text` content blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamJsonAdapter;

impl AgentAdapter for StreamJsonAdapter {
    fn name(&self) -> &str {
        "stream-json"
    }

    fn summarize_step(&self, event: &Value) -> Option<Value> {
        if event.get("type").and_then(Value::as_str) != Some("assistant") {
            return None;
        }
        let blocks = event
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)?;

        let tool_uses: Vec<Value> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
            .map(|b| {
                json!({
                    "name": b.get("name").cloned().unwrap_or(Value::Null),
                    "input": b.get("input").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        if !tool_uses.is_empty() {
            return Some(json!({ "tool_uses": tool_uses }));
        }

        let text: Vec<&str> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(json!({ "text": text.join("\n") }))
        }
    }
}

/// Explicit adapter registry. Keys are unique; there is no discovery.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn AgentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding [`GenericAdapter`] and [`StreamJsonAdapter`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for adapter in [
            Arc::new(GenericAdapter) as Arc<dyn AgentAdapter>,
            Arc::new(StreamJsonAdapter),
        ] {
            let key = adapter.name().to_string();
            registry.adapters.insert(key, adapter);
        }
        registry
    }

    /// Register `adapter` under `key`.
    ///
    /// # Errors
    ///
    /// `MediatorError::DuplicateRegistration` if `key` is taken.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        adapter: Arc<dyn AgentAdapter>,
    ) -> MediatorResult<()> {
        let key = key.into();
        if self.adapters.contains_key(&key) {
            return Err(MediatorError::DuplicateRegistration(format!("agent adapter '{key}'")));
        }
        self.adapters.insert(key, adapter);
        Ok(())
    }

    pub fn get(&self, key: &str) -> MediatorResult<Arc<dyn AgentAdapter>> {
        self.adapters
            .get(key)
            .cloned()
            .ok_or_else(|| MediatorError::UnknownAdapter(key.to_string()))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.keys())
            .finish()
    }
}
