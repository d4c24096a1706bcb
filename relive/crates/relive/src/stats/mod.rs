//! Stats Module - update monitoring
//!
//! Counters for requests, per-class outcomes, barrier traffic and instance
//! migrations, plus a histogram of pause times.

pub mod histogram;
pub mod timer;

pub use histogram::Histogram;
pub use timer::{PhaseTimer, ScopedTimer};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::migration::TransitionKind;
use crate::orchestrator::ClassState;

/// Statistics collector shared by the coordinator and application threads
pub struct UpdateStats {
    requests_submitted: AtomicU64,
    requests_finished: AtomicU64,
    requests_failed: AtomicU64,
    requests_discarded: AtomicU64,
    interrupted_attempts: AtomicU64,
    system_modified_retries: AtomicU64,

    classes_relinked: AtomicU64,
    classes_swapped: AtomicU64,
    classes_redefined: AtomicU64,
    classes_deleted: AtomicU64,
    classes_added: AtomicU64,
    classes_failed: AtomicU64,

    barriers_installed: AtomicU64,
    barriers_fired: AtomicU64,
    frames_repaired: AtomicU64,

    migrations: [AtomicU64; TransitionKind::COUNT],
    transformer_failures: AtomicU64,

    /// Pause durations in nanoseconds
    pause_stats: Arc<Histogram>,
    start_time: std::time::Instant,
}

impl UpdateStats {
    pub fn new() -> Self {
        Self {
            requests_submitted: AtomicU64::new(0),
            requests_finished: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_discarded: AtomicU64::new(0),
            interrupted_attempts: AtomicU64::new(0),
            system_modified_retries: AtomicU64::new(0),
            classes_relinked: AtomicU64::new(0),
            classes_swapped: AtomicU64::new(0),
            classes_redefined: AtomicU64::new(0),
            classes_deleted: AtomicU64::new(0),
            classes_added: AtomicU64::new(0),
            classes_failed: AtomicU64::new(0),
            barriers_installed: AtomicU64::new(0),
            barriers_fired: AtomicU64::new(0),
            frames_repaired: AtomicU64::new(0),
            migrations: Default::default(),
            transformer_failures: AtomicU64::new(0),
            pause_stats: Arc::new(Histogram::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.requests_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupted(&self) {
        self.interrupted_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_system_modified(&self) {
        self.system_modified_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a class that reached a terminal state during apply
    pub fn record_class(&self, state: ClassState) {
        let counter = match state {
            ClassState::Relinked => &self.classes_relinked,
            ClassState::Swapped => &self.classes_swapped,
            ClassState::Redefined => &self.classes_redefined,
            ClassState::Deleted => &self.classes_deleted,
            ClassState::Added => &self.classes_added,
            ClassState::Failed => &self.classes_failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier_installed(&self) {
        self.barriers_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier_fired(&self) {
        self.barriers_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_repaired(&self, n: usize) {
        self.frames_repaired.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_migration(&self, kind: TransitionKind) {
        self.migrations[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transformer_failure(&self) {
        self.transformer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pause(&self, duration: Duration) {
        self.pause_stats.record(duration.as_nanos() as u64);
    }

    pub fn pause_histogram(&self) -> Arc<Histogram> {
        Arc::clone(&self.pause_stats)
    }

    /// Objects migrated through one transition kind
    pub fn migrations(&self, kind: TransitionKind) -> u64 {
        self.migrations[kind.index()].load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> UpdateSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        UpdateSummary {
            requests_submitted: load(&self.requests_submitted),
            requests_finished: load(&self.requests_finished),
            requests_failed: load(&self.requests_failed),
            requests_discarded: load(&self.requests_discarded),
            interrupted_attempts: load(&self.interrupted_attempts),
            system_modified_retries: load(&self.system_modified_retries),
            classes_relinked: load(&self.classes_relinked),
            classes_swapped: load(&self.classes_swapped),
            classes_redefined: load(&self.classes_redefined),
            classes_deleted: load(&self.classes_deleted),
            classes_added: load(&self.classes_added),
            classes_failed: load(&self.classes_failed),
            barriers_installed: load(&self.barriers_installed),
            barriers_fired: load(&self.barriers_fired),
            frames_repaired: load(&self.frames_repaired),
            objects_migrated: self.migrations.iter().map(load).sum(),
            transformer_failures: load(&self.transformer_failures),
            avg_pause_ms: self.pause_stats.mean() as f64 / 1_000_000.0,
            max_pause_ms: self.pause_stats.max() as f64 / 1_000_000.0,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.requests_submitted,
            &self.requests_finished,
            &self.requests_failed,
            &self.requests_discarded,
            &self.interrupted_attempts,
            &self.system_modified_retries,
            &self.classes_relinked,
            &self.classes_swapped,
            &self.classes_redefined,
            &self.classes_deleted,
            &self.classes_added,
            &self.classes_failed,
            &self.barriers_installed,
            &self.barriers_fired,
            &self.frames_repaired,
            &self.transformer_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.migrations {
            counter.store(0, Ordering::Relaxed);
        }
        self.pause_stats.clear();
    }
}

impl Default for UpdateStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of [`UpdateStats`]
#[derive(Debug, Default, Clone, Serialize)]
pub struct UpdateSummary {
    pub requests_submitted: u64,
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub requests_discarded: u64,
    pub interrupted_attempts: u64,
    pub system_modified_retries: u64,
    pub classes_relinked: u64,
    pub classes_swapped: u64,
    pub classes_redefined: u64,
    pub classes_deleted: u64,
    pub classes_added: u64,
    pub classes_failed: u64,
    pub barriers_installed: u64,
    pub barriers_fired: u64,
    pub frames_repaired: u64,
    pub objects_migrated: u64,
    pub transformer_failures: u64,
    pub avg_pause_ms: f64,
    pub max_pause_ms: f64,
    pub uptime_secs: u64,
}
