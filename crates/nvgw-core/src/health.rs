//! Gateway health flag.
//!
//! Reconciliation failures never surface to API callers; they set this
//! flag instead, and the monitor client reports it upstream. The flag
//! clears once the reconciler converges again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared health state, cheap to clone and lock-free to read.
#[derive(Debug, Default)]
pub struct HealthFlag {
    degraded: AtomicBool,
    failures: AtomicU64,
}

impl HealthFlag {
    /// Creates a healthy flag.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks the gateway degraded (reconciliation mismatch persists).
    pub fn mark_degraded(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(true, Ordering::Release);
    }

    /// Clears the degraded state after convergence.
    pub fn mark_converged(&self) {
        self.degraded.store(false, Ordering::Release);
    }

    /// Whether the gateway is currently degraded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Total reconciliation failures since start.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_lifecycle() {
        let flag = HealthFlag::new();
        assert!(!flag.is_degraded());
        flag.mark_degraded();
        flag.mark_degraded();
        assert!(flag.is_degraded());
        assert_eq!(flag.failure_count(), 2);
        flag.mark_converged();
        assert!(!flag.is_degraded());
        assert_eq!(flag.failure_count(), 2);
    }
}
