//! Update Logging and Tracing
//!
//! Structured events for update requests, useful for:
//! - Auditing what an update actually changed
//! - Debugging stuck requests (which thread holds a barrier)
//! - Measuring pause times
//!
//! Log Levels:
//! - ERROR: failed requests and classes
//! - WARN: interrupted pauses, migration failures
//! - INFO: request lifecycle
//! - DEBUG: per-class decisions, barriers
//! - TRACE: per-object migration

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Log level for update operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Update event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// Request accepted by the coordinator
    RequestSubmitted { request: u64, classes: usize },

    /// Prepare finished
    RequestPrepared {
        request: u64,
        changed: usize,
        duration_ms: f64,
    },

    /// A class pair was classified
    ClassClassified {
        class: String,
        updating_type: String,
    },

    /// A pause attempt started
    PauseAttempt { request: u64, attempt: u32 },

    /// A pause found unsafe threads and was deferred
    RequestInterrupted { request: u64, unsafe_threads: usize },

    /// Return barrier installed on a thread
    BarrierInstalled { thread: u64, frame: u64 },

    /// Return barrier fired
    BarrierFired { thread: u64 },

    /// A class reached its target state
    ClassApplied { class: String, state: String },

    /// A class failed during apply
    ClassFailed { class: String, reason: String },

    /// Request settled
    RequestFinished {
        request: u64,
        state: String,
        code: String,
        duration_ms: f64,
    },

    /// Pause time of one update phase
    Pause { phase: String, duration_us: u64 },

    /// One instance changed shape
    ObjectMigrated { object: u64, transition: String },

    /// Custom transformer failed; object left stale
    MigrationFailed { object: u64, reason: String },

    /// Eager sweep completed
    EagerSweep {
        objects: usize,
        workers: usize,
        duration_ms: f64,
    },
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct UpdateLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Append events to this file
    pub file: Option<PathBuf>,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,
}

impl Default for UpdateLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            file: None,
            json: false,
            timestamps: true,
        }
    }
}

/// Centralized event log for update operations
pub struct UpdateLogger {
    config: UpdateLoggerConfig,
    events: Mutex<Vec<(Instant, UpdateEvent)>>,
    enabled: AtomicBool,
}

impl UpdateLogger {
    pub fn new(config: UpdateLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log an update event
    pub fn log(&self, event: UpdateEvent) {
        if !self.is_enabled() {
            return;
        }

        if Self::event_level(&event) > self.config.level {
            return;
        }

        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), event.clone()));
        }

        if self.config.console {
            println!("{}", self.render(&event));
        }

        if let Some(path) = &self.config.file {
            let line = self.render(&event);
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", line));
            if let Err(e) = written {
                log::warn!("update log file {} not writable: {}", path.display(), e);
            }
        }
    }

    fn event_level(event: &UpdateEvent) -> LogLevel {
        match event {
            UpdateEvent::ClassFailed { .. } => LogLevel::Error,
            UpdateEvent::RequestInterrupted { .. } | UpdateEvent::MigrationFailed { .. } => {
                LogLevel::Warn
            },
            UpdateEvent::RequestSubmitted { .. }
            | UpdateEvent::RequestPrepared { .. }
            | UpdateEvent::RequestFinished { .. }
            | UpdateEvent::EagerSweep { .. } => LogLevel::Info,
            UpdateEvent::ClassClassified { .. }
            | UpdateEvent::PauseAttempt { .. }
            | UpdateEvent::BarrierInstalled { .. }
            | UpdateEvent::BarrierFired { .. }
            | UpdateEvent::ClassApplied { .. }
            | UpdateEvent::Pause { .. } => LogLevel::Debug,
            UpdateEvent::ObjectMigrated { .. } => LogLevel::Trace,
        }
    }

    fn render(&self, event: &UpdateEvent) -> String {
        let body = if self.config.json {
            serde_json::to_string(event).unwrap_or_default()
        } else {
            Self::human(event)
        };

        if self.config.timestamps {
            let now = chrono::Local::now();
            format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), body)
        } else {
            body
        }
    }

    fn human(event: &UpdateEvent) -> String {
        match event {
            UpdateEvent::RequestSubmitted { request, classes } => {
                format!("[UPD] Request {} submitted ({} classes)", request, classes)
            },
            UpdateEvent::RequestPrepared {
                request,
                changed,
                duration_ms,
            } => format!(
                "[UPD] Request {} prepared: {} changed ({:.2}ms)",
                request, changed, duration_ms
            ),
            UpdateEvent::ClassClassified {
                class,
                updating_type,
            } => format!("[UPD] {} classified as {}", class, updating_type),
            UpdateEvent::PauseAttempt { request, attempt } => {
                format!("[UPD] Request {}: pause attempt {}", request, attempt)
            },
            UpdateEvent::RequestInterrupted {
                request,
                unsafe_threads,
            } => format!(
                "[UPD] Request {} interrupted: {} threads unsafe",
                request, unsafe_threads
            ),
            UpdateEvent::BarrierInstalled { thread, frame } => {
                format!("[UPD] Barrier installed on thread {} at frame {}", thread, frame)
            },
            UpdateEvent::BarrierFired { thread } => {
                format!("[UPD] Barrier fired on thread {}", thread)
            },
            UpdateEvent::ClassApplied { class, state } => {
                format!("[UPD] {} -> {}", class, state)
            },
            UpdateEvent::ClassFailed { class, reason } => {
                format!("[UPD] {} failed: {}", class, reason)
            },
            UpdateEvent::RequestFinished {
                request,
                state,
                code,
                duration_ms,
            } => format!(
                "[UPD] Request {} {} [{}] ({:.2}ms)",
                request, state, code, duration_ms
            ),
            UpdateEvent::Pause { phase, duration_us } => {
                format!("[UPD] {} pause: {} us", phase, duration_us)
            },
            UpdateEvent::ObjectMigrated { object, transition } => {
                format!("[UPD] Object {} migrated ({})", object, transition)
            },
            UpdateEvent::MigrationFailed { object, reason } => {
                format!("[UPD] Object {} left stale: {}", object, reason)
            },
            UpdateEvent::EagerSweep {
                objects,
                workers,
                duration_ms,
            } => format!(
                "[UPD] Eager sweep: {} objects on {} workers ({:.2}ms)",
                objects, workers, duration_ms
            ),
        }
    }

    pub fn get_events(&self) -> Vec<(Instant, UpdateEvent)> {
        if let Ok(events) = self.events.lock() {
            events.clone()
        } else {
            Vec::new()
        }
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn event_count(&self) -> usize {
        if let Ok(events) = self.events.lock() {
            events.len()
        } else {
            0
        }
    }
}

impl Default for UpdateLogger {
    fn default() -> Self {
        Self::new(UpdateLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<UpdateLogger> = Mutex::new(UpdateLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: UpdateEvent) {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.log(event);
    }
}

/// Replace the global logger
pub fn configure_logger(config: UpdateLoggerConfig) {
    if let Ok(mut logger) = GLOBAL_LOGGER.lock() {
        *logger = UpdateLogger::new(config);
    }
}

/// Global logger event count
pub fn get_event_count() -> usize {
    if let Ok(logger) = GLOBAL_LOGGER.lock() {
        logger.event_count()
    } else {
        0
    }
}
