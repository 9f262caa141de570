use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Pending work & activity accounting of a demand-based job.
pub struct XactDemand {
    base: Instant,
    /// Millis since `base` of the last accepted unit of work or completion.
    last_active: AtomicU64,
    pending: AtomicI64,
    /// The duration of inactivity after which the job stops itself.
    totally_idle: Duration,
    /// The duration of inactivity after which the job reports itself as idle.
    likely_idle: Duration,
}

impl XactDemand {
    pub fn new(totally_idle: Duration, likely_idle: Duration) -> Self {
        Self {
            base: Instant::now(),
            last_active: AtomicU64::new(0),
            pending: AtomicI64::new(0),
            totally_idle,
            likely_idle,
        }
    }

    pub fn touch(&self) {
        self.last_active.fetch_max(self.base.elapsed().as_millis() as u64, Ordering::AcqRel);
    }

    /// Account for a newly accepted unit of work.
    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    /// Account for a completed unit of work, whatever its outcome.
    pub fn dec_pending(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            tracing::error!(pending = prev - 1, "job pending count dropped below zero");
        }
        self.touch();
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn since_last_active(&self) -> Duration {
        let last = self.base + Duration::from_millis(self.last_active.load(Ordering::Acquire));
        last.elapsed()
    }

    /// Check if there is no pending work & no activity within the likely-idle window.
    pub fn is_idle(&self) -> bool {
        self.pending() <= 0 && self.since_last_active() >= self.likely_idle
    }

    /// Check if there is no pending work & no activity within the totally-idle window.
    pub fn is_totally_idle(&self) -> bool {
        self.pending() <= 0 && self.since_last_active() >= self.totally_idle
    }

    /// The time at which the idle timer should next fire.
    pub fn next_idle_check(&self) -> tokio::time::Instant {
        let remaining = self.totally_idle.saturating_sub(self.since_last_active());
        tokio::time::Instant::now() + remaining.max(self.likely_idle.min(self.totally_idle))
    }
}
