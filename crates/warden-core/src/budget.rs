//! Per-session consumable budgets and call rate limiting.
//!
//! A budget is a map of named dimensions to remaining quantities. Dimensions
//! that are not configured are unlimited. A dimension at zero stays at zero
//! until [`SessionBudget::reset`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MediatorError, MediatorResult};

/// Number of tool calls the session may issue.
pub const TOOL_CALLS: &str = "tool_calls";
/// Milliseconds of dispatch time the session may consume.
pub const EXECUTION_MS: &str = "execution_ms";

/// Rule name reported when the rate limit denies a call.
pub const RATE_LIMIT_RULE: &str = "rate_limit";

#[derive(Debug)]
pub struct SessionBudget {
    initial: BTreeMap<String, u64>,
    remaining: Mutex<BTreeMap<String, u64>>,
}

impl SessionBudget {
    pub fn new(limits: BTreeMap<String, u64>) -> Self {
        Self {
            remaining: Mutex::new(limits.clone()),
            initial: limits,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BTreeMap::new())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, u64>> {
        // Every critical section leaves the map consistent.
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one tool call: fail if any dimension is exhausted, otherwise
    /// take one unit of `tool_calls`. Check and decrement are atomic.
    pub fn admit_call(&self) -> MediatorResult<()> {
        let mut remaining = self.lock();
        if let Some((dimension, _)) = remaining.iter().find(|(_, left)| **left == 0) {
            return Err(MediatorError::budget_exhausted(dimension.clone()));
        }
        if let Some(left) = remaining.get_mut(TOOL_CALLS) {
            *left -= 1;
        }
        Ok(())
    }

    /// Take `amount` from `dimension` if that much is left.
    pub fn try_consume(&self, dimension: &str, amount: u64) -> MediatorResult<Option<u64>> {
        let mut remaining = self.lock();
        match remaining.get_mut(dimension) {
            None => Ok(None),
            Some(left) if *left < amount || *left == 0 => {
                Err(MediatorError::budget_exhausted(dimension))
            }
            Some(left) => {
                *left -= amount;
                Ok(Some(*left))
            }
        }
    }

    /// Charge `amount` against `dimension`, saturating at zero. Used for
    /// resources measured after the fact, such as dispatch time.
    /// Returns what is left, or `None` when the dimension is unlimited.
    pub fn charge(&self, dimension: &str, amount: u64) -> Option<u64> {
        let mut remaining = self.lock();
        let left = remaining.get_mut(dimension)?;
        *left = left.saturating_sub(amount);
        Some(*left)
    }

    pub fn remaining(&self, dimension: &str) -> Option<u64> {
        self.lock().get(dimension).copied()
    }

    /// The first dimension (in name order) that has reached zero.
    pub fn first_exhausted(&self) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, left)| **left == 0)
            .map(|(dimension, _)| dimension.clone())
    }

    pub fn reset(&self) {
        *self.lock() = self.initial.clone();
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.lock().clone()
    }
}

/// At most `max_calls` calls per `per_secs` seconds. `max_calls == 0`
/// disables the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_calls: u32,
    pub per_secs: u64,
}

impl RateLimit {
    pub fn new(max_calls: u32, per_secs: u64) -> Self {
        Self {
            max_calls,
            per_secs,
        }
    }

    pub fn deny_reason(&self) -> String {
        format!(
            "Rate limit exceeded: at most {} tool calls per {} seconds. \
             Wait before retrying, or batch the work into fewer calls.",
            self.max_calls, self.per_secs
        )
    }
}

/// Sliding-window enforcement of a [`RateLimit`].
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    hits: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Record a call at `now` if it fits in the window. Rejected calls are
    /// not recorded.
    pub fn admit(&self, now: DateTime<Utc>) -> bool {
        if self.limit.max_calls == 0 {
            return true;
        }
        let window = i64::try_from(self.limit.per_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        let cutoff = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }
        if hits.len() >= self.limit.max_calls as usize {
            return false;
        }
        hits.push_back(now);
        true
    }

    /// Forget every recorded call.
    pub fn clear(&self) {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
