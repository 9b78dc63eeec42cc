//! Global atomic counters for swarm runs.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits them as a
//! single `info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    builds_executed: AtomicU64,
    build_cache_hits: AtomicU64,
    pushes: AtomicU64,
    push_retries: AtomicU64,
    applies: AtomicU64,
    apply_retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            builds_executed: AtomicU64::new(0),
            build_cache_hits: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            push_retries: AtomicU64::new(0),
            applies: AtomicU64::new(0),
            apply_retries: AtomicU64::new(0),
        }
    }

    pub fn inc_builds(&self) {
        self.builds_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_executed", "counter incremented");
    }

    pub fn inc_build_cache_hits(&self) {
        self.build_cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "build_cache_hits", "counter incremented");
    }

    pub fn inc_pushes(&self) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pushes", "counter incremented");
    }

    pub fn inc_push_retries(&self) {
        self.push_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "push_retries", "counter incremented");
    }

    pub fn inc_applies(&self) {
        self.applies.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "applies", "counter incremented");
    }

    pub fn inc_apply_retries(&self) {
        self.apply_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "apply_retries", "counter incremented");
    }

    /// Emit all current counter values as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            builds_executed = self.builds_executed(),
            build_cache_hits = self.build_cache_hits(),
            pushes = self.pushes(),
            push_retries = self.push_retries(),
            applies = self.applies(),
            apply_retries = self.apply_retries(),
        );
    }

    pub fn builds_executed(&self) -> u64 {
        self.builds_executed.load(Ordering::Relaxed)
    }

    pub fn build_cache_hits(&self) -> u64 {
        self.build_cache_hits.load(Ordering::Relaxed)
    }

    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn push_retries(&self) -> u64 {
        self.push_retries.load(Ordering::Relaxed)
    }

    pub fn applies(&self) -> u64 {
        self.applies.load(Ordering::Relaxed)
    }

    pub fn apply_retries(&self) -> u64 {
        self.apply_retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.builds_executed,
            &self.build_cache_hits,
            &self.pushes,
            &self.push_retries,
            &self.applies,
            &self.apply_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
