//! Logger capability injected into the scan engine and the router
//!
//! The core never reaches for a global logger. It is handed an
//! `Arc<dyn Logger>` and writes plain messages through it; the sinks below
//! decide where those messages end up.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// Shared handle to a logger sink
pub type SharedLogger = Arc<dyn Logger>;

/// Minimal logging capability: informational and error records
pub trait Logger: Send + Sync {
    fn info(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Forwards records to `tracing`, tagged with a logger name.
///
/// Whether they land on the console, in a file or both is decided by the
/// subscriber installed in `main`.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    name: String,
}

impl TracingLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn shared(name: impl Into<String>) -> SharedLogger {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Logger for TracingLogger {
    fn info(&self, msg: &str) {
        info!(logger = %self.name, "{}", msg);
    }

    fn error(&self, msg: &str) {
        error!(logger = %self.name, "{}", msg);
    }
}

/// Sends every record to each child sink, in order
#[derive(Default)]
pub struct FanoutLogger {
    sinks: Vec<SharedLogger>,
}

impl FanoutLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink (builder pattern)
    pub fn with_sink(mut self, sink: SharedLogger) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Logger for FanoutLogger {
    fn info(&self, msg: &str) {
        for sink in &self.sinks {
            sink.info(msg);
        }
    }

    fn error(&self, msg: &str) {
        for sink in &self.sinks {
            sink.error(msg);
        }
    }
}

/// Severity of a recorded line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far
    pub fn records(&self) -> Vec<(Level, String)> {
        self.records.lock().clone()
    }

    pub fn lines(&self, level: Level) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.records.lock().iter().any(|(_, msg)| msg.contains(needle))
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl Logger for MemoryLogger {
    fn info(&self, msg: &str) {
        self.records.lock().push((Level::Info, msg.to_string()));
    }

    fn error(&self, msg: &str) {
        self.records.lock().push((Level::Error, msg.to_string()));
    }
}
