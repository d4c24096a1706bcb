//! Timing utilities for update phases.

use std::time::{Duration, Instant};

/// Timer for measuring one update phase
pub struct PhaseTimer {
    start: Instant,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a callback with the elapsed time when dropped
pub struct ScopedTimer<'a> {
    start: Instant,
    callback: Box<dyn FnMut(Duration) + 'a>,
}

impl<'a> ScopedTimer<'a> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(Duration) + 'a,
    {
        Self {
            start: Instant::now(),
            callback: Box::new(callback),
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        (self.callback)(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_scoped_timer_fires_on_drop() {
        let fired = Cell::new(false);
        {
            let _t = ScopedTimer::new(|_| fired.set(true));
            assert!(!fired.get());
        }
        assert!(fired.get());
    }
}
