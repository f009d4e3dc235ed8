use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the tracing pipeline.
///
/// Updated from the ring-buffer consumer threads, so every field is atomic.
pub struct Metrics {
    pub func_events_total: AtomicU64,
    pub packet_events_total: AtomicU64,
    pub start_time: SystemTime,
    events_this_sec: AtomicU64,
    events_per_sec: AtomicU64,
    rb_overflows: AtomicU64,
    store_errors: AtomicU64,
    attached_probes: AtomicUsize,
    skipped_probes: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            func_events_total: AtomicU64::new(0),
            packet_events_total: AtomicU64::new(0),
            start_time: SystemTime::now(),
            events_this_sec: AtomicU64::new(0),
            events_per_sec: AtomicU64::new(0),
            rb_overflows: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            attached_probes: AtomicUsize::new(0),
            skipped_probes: AtomicUsize::new(0),
        }
    }

    pub fn record_func_event(&self) {
        self.func_events_total.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_event(&self) {
        self.packet_events_total.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per second to refresh the events-per-second metric.
    pub fn rollup(&self) {
        let per_sec = self.events_this_sec.swap(0, Ordering::Relaxed);
        self.events_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec.load(Ordering::Relaxed)
    }

    pub fn inc_rb_overflow(&self) {
        self.rb_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rb_overflows(&self) -> u64 {
        self.rb_overflows.load(Ordering::Relaxed)
    }

    pub fn inc_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    pub fn add_attached_probes(&self, count: usize) {
        self.attached_probes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn attached_probes(&self) -> usize {
        self.attached_probes.load(Ordering::Relaxed)
    }

    pub fn add_skipped_probes(&self, count: usize) {
        self.skipped_probes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn skipped_probes(&self) -> usize {
        self.skipped_probes.load(Ordering::Relaxed)
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
