//! Global atomic counters for mediator observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at session close).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    calls_received: AtomicU64,
    calls_allowed: AtomicU64,
    calls_denied: AtomicU64,
    calls_escalated: AtomicU64,
    dispatch_errors: AtomicU64,
    loops_suspected: AtomicU64,
    escalations_timed_out: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            calls_received: AtomicU64::new(0),
            calls_allowed: AtomicU64::new(0),
            calls_denied: AtomicU64::new(0),
            calls_escalated: AtomicU64::new(0),
            dispatch_errors: AtomicU64::new(0),
            loops_suspected: AtomicU64::new(0),
            escalations_timed_out: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_calls_received(&self) {
        Self::bump(&self.calls_received, "calls_received");
    }

    pub fn inc_calls_allowed(&self) {
        Self::bump(&self.calls_allowed, "calls_allowed");
    }

    pub fn inc_calls_denied(&self) {
        Self::bump(&self.calls_denied, "calls_denied");
    }

    pub fn inc_calls_escalated(&self) {
        Self::bump(&self.calls_escalated, "calls_escalated");
    }

    pub fn inc_dispatch_errors(&self) {
        Self::bump(&self.dispatch_errors, "dispatch_errors");
    }

    pub fn inc_loops_suspected(&self) {
        Self::bump(&self.loops_suspected, "loops_suspected");
    }

    pub fn inc_escalations_timed_out(&self) {
        Self::bump(&self.escalations_timed_out, "escalations_timed_out");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            calls_received = self.calls_received(),
            calls_allowed = self.calls_allowed(),
            calls_denied = self.calls_denied(),
            calls_escalated = self.calls_escalated(),
            dispatch_errors = self.dispatch_errors(),
            loops_suspected = self.loops_suspected(),
            escalations_timed_out = self.escalations_timed_out(),
        );
    }

    pub fn calls_received(&self) -> u64 {
        self.calls_received.load(Ordering::Relaxed)
    }

    pub fn calls_allowed(&self) -> u64 {
        self.calls_allowed.load(Ordering::Relaxed)
    }

    pub fn calls_denied(&self) -> u64 {
        self.calls_denied.load(Ordering::Relaxed)
    }

    pub fn calls_escalated(&self) -> u64 {
        self.calls_escalated.load(Ordering::Relaxed)
    }

    pub fn dispatch_errors(&self) -> u64 {
        self.dispatch_errors.load(Ordering::Relaxed)
    }

    pub fn loops_suspected(&self) -> u64 {
        self.loops_suspected.load(Ordering::Relaxed)
    }

    pub fn escalations_timed_out(&self) -> u64 {
        self.escalations_timed_out.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.calls_received,
            &self.calls_allowed,
            &self.calls_denied,
            &self.calls_escalated,
            &self.dispatch_errors,
            &self.loops_suspected,
            &self.escalations_timed_out,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.calls_received(), 0);
        m.inc_calls_received();
        m.inc_calls_received();
        assert_eq!(m.calls_received(), 2);

        m.inc_calls_denied();
        assert_eq!(m.calls_denied(), 1);

        m.inc_loops_suspected();
        m.inc_escalations_timed_out();
        assert_eq!(m.loops_suspected(), 1);
        assert_eq!(m.escalations_timed_out(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_calls_allowed();
        m.inc_calls_escalated();
        m.inc_dispatch_errors();
        m.reset();
        assert_eq!(m.calls_allowed(), 0);
        assert_eq!(m.calls_escalated(), 0);
        assert_eq!(m.dispatch_errors(), 0);
    }
}
