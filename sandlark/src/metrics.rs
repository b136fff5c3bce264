use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Process-wide counters for the sandbox host.
///
/// One instance is shared by reference across every sandbox and adapter, so
/// all fields are atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    sandboxes_created: AtomicUsize,
    sandboxes_terminated: AtomicUsize,
    messages_processed: AtomicU64,
    process_failures: AtomicU64,
    timer_events: AtomicU64,
    injected_events: AtomicU64,
    output_bytes: AtomicU64,
    preserve_failures: AtomicU64,
    restore_failures: AtomicU64,
    slow_terminations: AtomicU64,
    // Per-second tracking
    messages_this_sec: AtomicU64,
    messages_per_sec: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            sandboxes_created: AtomicUsize::new(0),
            sandboxes_terminated: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            process_failures: AtomicU64::new(0),
            timer_events: AtomicU64::new(0),
            injected_events: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            preserve_failures: AtomicU64::new(0),
            restore_failures: AtomicU64::new(0),
            slow_terminations: AtomicU64::new(0),
            messages_this_sec: AtomicU64::new(0),
            messages_per_sec: AtomicU64::new(0),
        }
    }

    pub fn inc_sandboxes_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandboxes_created(&self) -> usize {
        self.sandboxes_created.load(Ordering::Relaxed)
    }

    pub fn inc_sandboxes_terminated(&self) {
        self.sandboxes_terminated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sandboxes_terminated(&self) -> usize {
        self.sandboxes_terminated.load(Ordering::Relaxed)
    }

    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.messages_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Called periodically to refresh the messages-per-second metric.
    pub fn rollup(&self) {
        let per_sec = self.messages_this_sec.swap(0, Ordering::Relaxed);
        self.messages_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn messages_per_sec(&self) -> u64 {
        self.messages_per_sec.load(Ordering::Relaxed)
    }

    pub fn inc_process_failure(&self) {
        self.process_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn process_failures(&self) -> u64 {
        self.process_failures.load(Ordering::Relaxed)
    }

    pub fn inc_timer_event(&self) {
        self.timer_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timer_events(&self) -> u64 {
        self.timer_events.load(Ordering::Relaxed)
    }

    pub fn add_injected(&self, count: u64) {
        self.injected_events.fetch_add(count, Ordering::Relaxed);
    }

    pub fn injected_events(&self) -> u64 {
        self.injected_events.load(Ordering::Relaxed)
    }

    pub fn add_output_bytes(&self, count: u64) {
        self.output_bytes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    pub fn inc_preserve_failure(&self) {
        self.preserve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn preserve_failures(&self) -> u64 {
        self.preserve_failures.load(Ordering::Relaxed)
    }

    pub fn inc_restore_failure(&self) {
        self.restore_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restore_failures(&self) -> u64 {
        self.restore_failures.load(Ordering::Relaxed)
    }

    pub fn inc_slow_termination(&self) {
        self.slow_terminations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slow_terminations(&self) -> u64 {
        self.slow_terminations.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_resets_the_per_second_window() {
        let m = Metrics::new();
        for _ in 0..5 {
            m.record_message();
        }
        m.rollup();
        assert_eq!(m.messages_per_sec(), 5);
        m.rollup();
        assert_eq!(m.messages_per_sec(), 0);
        assert_eq!(m.messages_processed(), 5);
    }
}
