//! Mediator and session configuration.
//!
//! Both structs deserialize from TOML or JSON with every field optional
//! except a session's id and sandbox root. Loading the file is the caller's
//! job; [`MediatorConfig::validate`] and [`SessionConfig::validate`] report
//! what is missing or out of range.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::RateLimit;
use crate::error::{MediatorError, MediatorResult};
use crate::escalation::{default_escalation_dir, is_file_safe_id};
use crate::guard::GuardConfig;
use crate::policy::{NetworkPolicy, StandardPolicy};

/// Environment variable naming the shared state directory.
pub const STATE_DIR_ENV: &str = "WARDEN_STATE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// Shared with the listener daemon: session records and the listener lock.
    pub state_dir: PathBuf,
    /// How long an escalated call waits for the operator.
    pub escalation_timeout_secs: u64,
    /// Upper bound for a single dispatch to a tool server.
    pub dispatch_timeout_ms: u64,
    /// Poll interval for resolution artifacts written by the listener.
    pub resolution_poll_ms: u64,
    /// Longest request line accepted on the agent socket.
    pub max_request_bytes: usize,
    pub call_guard: GuardConfig,
    pub step_guard: GuardConfig,
    pub network: NetworkPolicy,
    pub standard_policy: StandardPolicy,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            escalation_timeout_secs: 300,
            dispatch_timeout_ms: 30_000,
            resolution_poll_ms: 250,
            max_request_bytes: 8 * 1024 * 1024,
            call_guard: GuardConfig::call_default(),
            step_guard: GuardConfig::step_default(),
            network: NetworkPolicy::default(),
            standard_policy: StandardPolicy::default(),
        }
    }
}

/// `$WARDEN_STATE_DIR`, or `warden` under the system temp directory.
pub fn default_state_dir() -> PathBuf {
    std::env::var_os(STATE_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("warden"))
}

impl MediatorConfig {
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn validate(&self) -> MediatorResult<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(MediatorError::Config("state_dir must be set".into()));
        }
        if self.escalation_timeout_secs == 0 {
            return Err(MediatorError::Config(
                "escalation_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(MediatorError::Config(
                "dispatch_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.resolution_poll_ms == 0 {
            return Err(MediatorError::Config(
                "resolution_poll_ms must be greater than zero".into(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(MediatorError::Config(
                "max_request_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn escalation_timeout(&self) -> Duration {
        Duration::from_secs(self.escalation_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn resolution_poll(&self) -> Duration {
        Duration::from_millis(self.resolution_poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_id: String,
    /// Shown to the operator next to escalations.
    #[serde(default)]
    pub label: String,
    /// Absolute path every filesystem argument is confined to.
    pub sandbox_root: PathBuf,
    /// Defaults to `<state_dir>/escalations/<session_id>`.
    #[serde(default)]
    pub escalation_dir: Option<PathBuf>,
    /// Dimension name → initial quantity. Absent dimensions are unlimited.
    #[serde(default)]
    pub budgets: BTreeMap<String, u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            label: String::new(),
            sandbox_root: sandbox_root.into(),
            escalation_dir: None,
            budgets: BTreeMap::new(),
            rate_limit: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_budget(mut self, dimension: impl Into<String>, quantity: u64) -> Self {
        self.budgets.insert(dimension.into(), quantity);
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_escalation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.escalation_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> MediatorResult<()> {
        if !is_file_safe_id(&self.session_id) {
            return Err(MediatorError::Config(format!(
                "session_id '{}' must be non-empty and use only [A-Za-z0-9._-]",
                self.session_id
            )));
        }
        if !self.sandbox_root.is_absolute() {
            return Err(MediatorError::Config(format!(
                "sandbox_root must be an absolute path, got '{}'",
                self.sandbox_root.display()
            )));
        }
        if let Some(dir) = &self.escalation_dir {
            if !dir.is_absolute() {
                return Err(MediatorError::Config(format!(
                    "escalation_dir must be an absolute path, got '{}'",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn resolved_escalation_dir(&self, state_dir: &Path) -> PathBuf {
        self.escalation_dir
            .clone()
            .unwrap_or_else(|| default_escalation_dir(state_dir, &self.session_id))
    }
}
