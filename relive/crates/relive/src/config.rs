//! Configuration Module - live-update tuning parameters
//!
//! Controls how instances are migrated, how the coordinator retries a pause
//! that found busy threads, and what gets traced.

use std::time::Duration;

/// How stale instances are brought to the new shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MigrationMode {
    /// Migrate each instance the first time it is touched after the update
    Lazy,
    /// Sweep the whole heap once during the update pause
    Eager,
}

/// Trace categories, combined into [`UpdateConfig::trace_flags`]
pub mod trace {
    pub const TIMER: u32 = 1 << 0;
    pub const PREPARE: u32 = 1 << 1;
    pub const CLASSIFY: u32 = 1 << 2;
    pub const METHODS: u32 = 1 << 3;
    pub const FIELDS: u32 = 1 << 4;
    pub const APPLY: u32 = 1 << 5;
    pub const THREADS: u32 = 1 << 6;
    pub const BARRIERS: u32 = 1 << 7;
    pub const OBJECTS: u32 = 1 << 8;
    pub const EAGER: u32 = 1 << 9;
    pub const ALL: u32 = (1 << 10) - 1;
}

/// Main configuration for the update engine
///
/// # Examples
///
/// ```rust
/// use relive::config::{MigrationMode, UpdateConfig};
///
/// let config = UpdateConfig {
///     migration_mode: MigrationMode::Eager,
///     eager_workers: Some(2),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Lazy per-access or eager whole-heap instance migration
    ///
    /// Default: Lazy
    pub migration_mode: MigrationMode,

    /// Number of sweep workers used in eager mode
    ///
    /// If None, auto-detects: min(4, num_cpus).
    ///
    /// Default: Auto-detect
    pub eager_workers: Option<usize>,

    /// Fold mixed instances back into a single allocation during an eager
    /// sweep
    ///
    /// Default: false
    pub merge_mixed_on_eager: bool,

    /// Only the last thread holding a return barrier wakes the coordinator
    ///
    /// When false every barrier firing wakes it.
    ///
    /// Default: true
    pub eager_wakeup: bool,

    /// How long the coordinator waits for barriers before re-attempting a
    /// pause, in milliseconds
    ///
    /// Default: 50ms
    pub barrier_retry_interval_ms: u64,

    /// Maximum pause attempts per request before it fails with a timeout
    ///
    /// 0 means retry indefinitely.
    ///
    /// Default: 0
    pub max_retries: u32,

    /// Upper bound a synchronous submitter waits for a request to settle, in
    /// milliseconds. 0 waits forever.
    ///
    /// Default: 0
    pub request_timeout_ms: u64,

    /// Capacity of the request queue
    ///
    /// Default: 16
    pub queue_capacity: usize,

    /// Smallest surplus, in bytes, recorded as filler when an instance
    /// shrinks in place
    ///
    /// Default: 8
    pub min_fill_size: usize,

    /// Object size alignment in bytes
    ///
    /// Default: 8
    pub object_alignment: usize,

    /// Bitmask of [`trace`] categories
    ///
    /// Default: 0
    pub trace_flags: u32,

    /// Log request start/end and outcomes at info level
    ///
    /// Default: false
    pub verbose: bool,

    /// Collect counters and pause-time histogram
    ///
    /// Default: true
    pub stats_enabled: bool,

    /// Emit stale-object checks in instance methods of redefined classes
    ///
    /// Required for lazy migration. Disabling it with lazy mode is rejected.
    ///
    /// Default: true
    pub stale_object_checks: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            migration_mode: MigrationMode::Lazy,
            eager_workers: Some(num_cpus::get().clamp(1, 4)),
            merge_mixed_on_eager: false,

            eager_wakeup: true,
            barrier_retry_interval_ms: 50,
            max_retries: 0,
            request_timeout_ms: 0,
            queue_capacity: 16,

            min_fill_size: 8,
            object_alignment: 8,

            trace_flags: 0,
            verbose: false,
            stats_enabled: true,
            stale_object_checks: true,
        }
    }
}

impl UpdateConfig {
    /// Validate configuration
    ///
    /// ```rust
    /// use relive::config::UpdateConfig;
    ///
    /// let config = UpdateConfig {
    ///     object_alignment: 3,
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.object_alignment.is_power_of_two() || self.object_alignment < 8 {
            return Err(ConfigError::InvalidAlignment(format!(
                "object_alignment must be a power of two of at least 8, got {}",
                self.object_alignment
            )));
        }

        if self.min_fill_size == 0 || self.min_fill_size % self.object_alignment != 0 {
            return Err(ConfigError::InvalidFillSize(format!(
                "min_fill_size must be a positive multiple of {}, got {}",
                self.object_alignment, self.min_fill_size
            )));
        }

        if let Some(workers) = self.eager_workers {
            if workers == 0 || workers > 256 {
                return Err(ConfigError::InvalidWorkers(format!(
                    "eager_workers must be between 1 and 256, got {}",
                    workers
                )));
            }
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueue(
                "queue_capacity must be > 0".to_string(),
            ));
        }

        if self.barrier_retry_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval(
                "barrier_retry_interval_ms must be > 0".to_string(),
            ));
        }

        if self.migration_mode == MigrationMode::Lazy && !self.stale_object_checks {
            return Err(ConfigError::Inconsistent(
                "lazy migration requires stale_object_checks".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - RELIVE_MIGRATION (`lazy` or `eager`)
    /// - RELIVE_EAGER_WORKERS
    /// - RELIVE_MERGE_MIXED
    /// - RELIVE_EAGER_WAKEUP
    /// - RELIVE_RETRY_MS
    /// - RELIVE_MAX_RETRIES
    /// - RELIVE_TIMEOUT_MS
    /// - RELIVE_QUEUE_CAPACITY
    /// - RELIVE_MIN_FILL
    /// - RELIVE_ALIGNMENT
    /// - RELIVE_TRACE (bitmask, decimal or `0x` hex)
    /// - RELIVE_VERBOSE
    /// - RELIVE_STATS
    /// - RELIVE_STALE_CHECKS
    ///
    /// Booleans accept `1`/`0` and `true`/`false`. Unparsable values keep
    /// the default; the result still has to pass [`validate`](Self::validate).
    ///
    /// ```bash
    /// export RELIVE_MIGRATION=eager
    /// export RELIVE_TRACE=0x3ff
    /// ```
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = var("RELIVE_MIGRATION") {
            if val.eq_ignore_ascii_case("eager") {
                config.migration_mode = MigrationMode::Eager;
            } else if val.eq_ignore_ascii_case("lazy") {
                config.migration_mode = MigrationMode::Lazy;
            }
        }

        if let Some(workers) = var("RELIVE_EAGER_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
            config.eager_workers = Some(workers);
        }
        if let Some(merge) = var("RELIVE_MERGE_MIXED").and_then(|v| parse_bool(&v)) {
            config.merge_mixed_on_eager = merge;
        }
        if let Some(wakeup) = var("RELIVE_EAGER_WAKEUP").and_then(|v| parse_bool(&v)) {
            config.eager_wakeup = wakeup;
        }

        if let Some(ms) = var("RELIVE_RETRY_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.barrier_retry_interval_ms = ms;
        }
        if let Some(n) = var("RELIVE_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
            config.max_retries = n;
        }
        if let Some(ms) = var("RELIVE_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.request_timeout_ms = ms;
        }
        if let Some(n) = var("RELIVE_QUEUE_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
            config.queue_capacity = n;
        }

        if let Some(n) = var("RELIVE_MIN_FILL").and_then(|v| v.parse::<usize>().ok()) {
            config.min_fill_size = n;
        }
        if let Some(n) = var("RELIVE_ALIGNMENT").and_then(|v| v.parse::<usize>().ok()) {
            config.object_alignment = n;
        }

        if let Some(flags) = var("RELIVE_TRACE").and_then(|v| parse_flags(&v)) {
            config.trace_flags = flags;
        }
        if let Some(verbose) = var("RELIVE_VERBOSE").and_then(|v| parse_bool(&v)) {
            config.verbose = verbose;
        }
        if let Some(stats) = var("RELIVE_STATS").and_then(|v| parse_bool(&v)) {
            config.stats_enabled = stats;
        }
        if let Some(checks) = var("RELIVE_STALE_CHECKS").and_then(|v| parse_bool(&v)) {
            config.stale_object_checks = checks;
        }

        config
    }

    /// Check whether a trace category is enabled
    #[inline]
    pub fn traces(&self, category: u32) -> bool {
        self.trace_flags & category != 0
    }

    pub fn barrier_retry_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Sweep worker count with the auto-detect fallback applied
    pub fn effective_eager_workers(&self) -> usize {
        self.eager_workers
            .unwrap_or_else(|| num_cpus::get().clamp(1, 4))
    }

    /// Round `size` up to the object alignment
    #[inline]
    pub fn align(&self, size: usize) -> usize {
        (size + self.object_alignment - 1) & !(self.object_alignment - 1)
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim() {
        "1" => Some(true),
        "0" => Some(false),
        v if v.eq_ignore_ascii_case("true") => Some(true),
        v if v.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn parse_flags(val: &str) -> Option<u32> {
    let val = val.trim();
    match val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => val.parse::<u32>().ok(),
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid alignment: {0}")]
    InvalidAlignment(String),

    #[error("Invalid fill size: {0}")]
    InvalidFillSize(String),

    #[error("Invalid eager workers: {0}")]
    InvalidWorkers(String),

    #[error("Invalid queue: {0}")]
    InvalidQueue(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UpdateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration_mode, MigrationMode::Lazy);
        assert!(config.eager_wakeup);
        assert_eq!(config.min_fill_size, 8);
    }

    #[test]
    fn test_invalid_alignment() {
        let config = UpdateConfig {
            object_alignment: 12,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAlignment(_))
        ));
    }

    #[test]
    fn test_lazy_requires_checks() {
        let config = UpdateConfig {
            stale_object_checks: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let eager = UpdateConfig {
            stale_object_checks: false,
            migration_mode: MigrationMode::Eager,
            ..Default::default()
        };
        assert!(eager.validate().is_ok());
    }

    #[test]
    fn test_align() {
        let config = UpdateConfig::default();
        assert_eq!(config.align(0), 0);
        assert_eq!(config.align(1), 8);
        assert_eq!(config.align(12), 16);
        assert_eq!(config.align(16), 16);
    }

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags("0x3ff"), Some(trace::ALL));
        assert_eq!(parse_flags("5"), Some(trace::TIMER | trace::CLASSIFY));
        assert_eq!(parse_flags("nope"), None);
    }

    fn vars(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_from_vars_reads_every_setting() {
        let config = UpdateConfig::from_vars(vars(&[
            ("RELIVE_MIGRATION", "EAGER"),
            ("RELIVE_EAGER_WORKERS", "3"),
            ("RELIVE_MERGE_MIXED", "true"),
            ("RELIVE_EAGER_WAKEUP", "0"),
            ("RELIVE_RETRY_MS", "5"),
            ("RELIVE_MAX_RETRIES", "9"),
            ("RELIVE_TIMEOUT_MS", "2500"),
            ("RELIVE_QUEUE_CAPACITY", "64"),
            ("RELIVE_MIN_FILL", "16"),
            ("RELIVE_ALIGNMENT", "16"),
            ("RELIVE_TRACE", "0x80"),
            ("RELIVE_VERBOSE", "1"),
            ("RELIVE_STATS", "false"),
            ("RELIVE_STALE_CHECKS", "False"),
        ]));
        assert_eq!(config.migration_mode, MigrationMode::Eager);
        assert_eq!(config.eager_workers, Some(3));
        assert!(config.merge_mixed_on_eager);
        assert!(!config.eager_wakeup);
        assert_eq!(config.barrier_retry_interval(), Duration::from_millis(5));
        assert_eq!(config.max_retries, 9);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.min_fill_size, 16);
        assert_eq!(config.object_alignment, 16);
        assert!(config.traces(trace::BARRIERS));
        assert!(config.verbose);
        assert!(!config.stats_enabled);
        assert!(!config.stale_object_checks);
        assert!(config.validate().is_ok(), "eager mode runs without stale checks");
    }

    #[test]
    fn test_from_vars_keeps_defaults_on_garbage() {
        let config = UpdateConfig::from_vars(vars(&[
            ("RELIVE_MIGRATION", "sometimes"),
            ("RELIVE_TIMEOUT_MS", "-1"),
            ("RELIVE_QUEUE_CAPACITY", "lots"),
            ("RELIVE_VERBOSE", "yes please"),
        ]));
        let defaults = UpdateConfig::default();
        assert_eq!(config.migration_mode, defaults.migration_mode);
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.queue_capacity, defaults.queue_capacity);
        assert!(!config.verbose);

        let unset = UpdateConfig::from_vars(|_| None);
        assert!(unset.validate().is_ok());
    }

    #[test]
    fn test_from_vars_result_still_validated() {
        let config = UpdateConfig::from_vars(vars(&[("RELIVE_QUEUE_CAPACITY", "0")]));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQueue(_))));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("on"), None);
    }

    #[test]
    fn test_traces() {
        let config = UpdateConfig {
            trace_flags: trace::BARRIERS,
            ..Default::default()
        };
        assert!(config.traces(trace::BARRIERS));
        assert!(!config.traces(trace::APPLY));
    }
}
