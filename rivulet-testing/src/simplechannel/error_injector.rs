//! Error injection controller for testing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Controller for injecting errors during testing.
///
/// This allows tests to force specific error conditions like a full lane, failing writes or
/// acknowledgements that never reach the upstream side.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    /// Force the data lane to appear full.
    force_buffer_full: AtomicBool,
    /// Fail the next N writes.
    fail_next_writes: AtomicUsize,
    /// Silently drop the next N acks.
    drop_next_acks: AtomicUsize,
    /// Fail the next N acks with an error.
    fail_next_acks: AtomicUsize,
}

impl ErrorInjector {
    /// Create a new error injector with all errors disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data lane to appear full.
    pub fn set_buffer_full(&self, full: bool) {
        self.force_buffer_full.store(full, Ordering::Relaxed);
    }

    /// Fail the next N write operations.
    pub fn fail_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::Relaxed);
    }

    /// Drop the next N acknowledgements without telling the sender, as a lossy network would.
    pub fn drop_acks(&self, count: usize) {
        self.drop_next_acks.store(count, Ordering::Relaxed);
    }

    /// Fail the next N acknowledgements with an error.
    pub fn fail_acks(&self, count: usize) {
        self.fail_next_acks.store(count, Ordering::Relaxed);
    }

    pub(crate) fn is_buffer_full(&self) -> bool {
        self.force_buffer_full.load(Ordering::Relaxed)
    }

    pub(crate) fn should_fail_write(&self) -> bool {
        Self::decrement_counter(&self.fail_next_writes)
    }

    pub(crate) fn should_drop_ack(&self) -> bool {
        Self::decrement_counter(&self.drop_next_acks)
    }

    pub(crate) fn should_fail_ack(&self) -> bool {
        Self::decrement_counter(&self.fail_next_acks)
    }

    /// Decrements a counter and returns true if it was > 0.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                if c > 0 { Some(c - 1) } else { None }
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_decrement_to_zero() {
        let injector = ErrorInjector::new();
        injector.fail_writes(2);
        assert!(injector.should_fail_write());
        assert!(injector.should_fail_write());
        assert!(!injector.should_fail_write());

        injector.drop_acks(1);
        assert!(injector.should_drop_ack());
        assert!(!injector.should_drop_ack());
        assert!(!injector.should_fail_ack());
    }

    #[test]
    fn test_buffer_full_toggle() {
        let injector = ErrorInjector::new();
        assert!(!injector.is_buffer_full());
        injector.set_buffer_full(true);
        assert!(injector.is_buffer_full());
        injector.set_buffer_full(false);
        assert!(!injector.is_buffer_full());
    }
}
