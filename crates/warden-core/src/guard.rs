//! Repetition guard: sliding-window loop detection keyed by fingerprint.
//!
//! A session owns two independent instances, one for agent steps and one for
//! mediated tool calls. Each tracks, per fingerprint, the occurrences seen
//! inside the configured window and reports a suspected loop once that count
//! exceeds the threshold.
//!
//! The window is half-open: an occurrence exactly `window_secs` old has
//! already left it. [`crate::budget::RateLimiter`] uses the same boundary.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::fingerprint::Fingerprint;

/// Rule identifier reported when the call-level guard denies a call.
pub const GUARD_RULE: &str = "repetition_guard";

/// Counters are swept once the map grows past this many fingerprints.
const SWEEP_THRESHOLD: usize = 1024;

/// Threshold and window for one guard instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardConfig {
    /// Occurrences allowed inside the window. 0 = guard disabled.
    pub threshold: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl GuardConfig {
    pub fn new(threshold: u32, window_secs: u64) -> Self {
        Self {
            threshold,
            window_secs,
        }
    }

    /// Defaults for the mediator's per-call guard.
    pub fn call_default() -> Self {
        Self::new(3, 300)
    }

    /// Defaults for the per-step guard.
    pub fn step_default() -> Self {
        Self::new(5, 600)
    }

    pub fn window(&self) -> Duration {
        i64::try_from(self.window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window()).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::call_default()
    }
}

/// Result of observing one fingerprint occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GuardVerdict {
    Clear { occurrences: u32 },
    LoopSuspected { occurrences: u32 },
}

impl GuardVerdict {
    pub fn is_loop(&self) -> bool {
        matches!(self, GuardVerdict::LoopSuspected { .. })
    }

    pub fn occurrences(&self) -> u32 {
        match self {
            GuardVerdict::Clear { occurrences } | GuardVerdict::LoopSuspected { occurrences } => {
                *occurrences
            }
        }
    }
}

/// Occurrence timestamps for one fingerprint, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowCounter {
    hits: VecDeque<DateTime<Utc>>,
}

impl WindowCounter {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.hits.front().is_some_and(|t| *t <= cutoff) {
            self.hits.pop_front();
        }
    }

    pub fn count(&self) -> u32 {
        u32::try_from(self.hits.len()).unwrap_or(u32::MAX)
    }

    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.hits.front().copied()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.hits.back().copied()
    }
}

/// Sliding-window repetition detector.
#[derive(Debug)]
pub struct RepetitionGuard {
    name: String,
    config: GuardConfig,
    counters: Mutex<HashMap<Fingerprint, WindowCounter>>,
}

impl RepetitionGuard {
    pub fn new(name: impl Into<String>, config: GuardConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> GuardConfig {
        self.config
    }

    /// Record one occurrence of `fingerprint` at `now` and report whether the
    /// count inside the window now exceeds the threshold.
    ///
    /// Pruning, recording and the threshold check happen under one lock, so
    /// concurrent observations of the same fingerprint are never lost or
    /// double counted.
    pub async fn observe(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> GuardVerdict {
        let cutoff = self.config.cutoff(now);
        let mut counters = self.counters.lock().await;

        if counters.len() > SWEEP_THRESHOLD {
            counters.retain(|_, counter| {
                counter.prune(cutoff);
                counter.count() > 0
            });
        }

        let counter = counters.entry(fingerprint.clone()).or_default();
        counter.prune(cutoff);
        counter.hits.push_back(now);
        let occurrences = counter.count();

        if self.config.threshold > 0 && occurrences > self.config.threshold {
            tracing::debug!(
                guard = %self.name,
                fingerprint = %fingerprint.short(),
                occurrences,
                "repetition threshold exceeded"
            );
            GuardVerdict::LoopSuspected { occurrences }
        } else {
            GuardVerdict::Clear { occurrences }
        }
    }

    /// Occurrences of `fingerprint` inside the window ending at `now`,
    /// without recording a new one.
    pub async fn occurrences(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> u32 {
        let cutoff = self.config.cutoff(now);
        let counters = self.counters.lock().await;
        counters
            .get(fingerprint)
            .map(|c| c.hits.iter().filter(|t| **t > cutoff).count())
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Snapshot of the counter for `fingerprint`, if any.
    pub async fn counter(&self, fingerprint: &Fingerprint) -> Option<WindowCounter> {
        self.counters.lock().await.get(fingerprint).cloned()
    }

    /// Number of fingerprints currently tracked.
    pub async fn tracked(&self) -> usize {
        self.counters.lock().await.len()
    }

    /// Discard all state (session close).
    pub async fn clear(&self) {
        self.counters.lock().await.clear();
    }
}
