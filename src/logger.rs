//! Structured logging capability injected into the client.
//!
//! Every log call carries a message and a flat map of key-value fields.
//! Call sites build the fields explicitly, so payloads and headers only reach
//! a log sink when a field names them.

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

/// Structured key-value fields attached to a log entry.
pub type Fields = serde_json::Map<String, JsonValue>;

/// Converts a `json!({...})` object into [`Fields`].
///
/// Non-object values yield empty fields.
pub fn fields(value: JsonValue) -> Fields {
    match value {
        JsonValue::Object(map) => map,
        _ => Fields::new(),
    }
}

/// Logging sink used by the client and its observers.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str, fields: &Fields);
    fn info(&self, message: &str, fields: &Fields);
    fn error(&self, message: &str, fields: &Fields);
}

/// Returns the logger used when the caller does not inject one.
pub fn default_logger() -> Arc<dyn Logger> {
    #[cfg(feature = "tracing")]
    {
        Arc::new(TracingLogger)
    }
    #[cfg(not(feature = "tracing"))]
    {
        Arc::new(NoopLogger)
    }
}

/// Forwards log entries to `tracing` under the `resilient_http` target.
#[cfg(feature = "tracing")]
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

#[cfg(feature = "tracing")]
impl Logger for TracingLogger {
    fn debug(&self, message: &str, fields: &Fields) {
        tracing::debug!(target: "resilient_http", fields = %JsonValue::Object(fields.clone()), "{message}");
    }

    fn info(&self, message: &str, fields: &Fields) {
        tracing::info!(target: "resilient_http", fields = %JsonValue::Object(fields.clone()), "{message}");
    }

    fn error(&self, message: &str, fields: &Fields) {
        tracing::error!(target: "resilient_http", fields = %JsonValue::Object(fields.clone()), "{message}");
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _message: &str, _fields: &Fields) {}
    fn info(&self, _message: &str, _fields: &Fields) {}
    fn error(&self, _message: &str, _fields: &Fields) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub fields: Fields,
}

/// Keeps every entry in memory.
///
/// Meant for tests that assert on what the client logged.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Entries with the given level and message.
    pub fn matching(&self, level: LogLevel, message: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == level && entry.message == message)
            .collect()
    }

    fn push(&self, level: LogLevel, message: &str, fields: &Fields) {
        let entry = LogEntry {
            level,
            message: message.to_owned(),
            fields: fields.clone(),
        };
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

impl Logger for MemoryLogger {
    fn debug(&self, message: &str, fields: &Fields) {
        self.push(LogLevel::Debug, message, fields);
    }

    fn info(&self, message: &str, fields: &Fields) {
        self.push(LogLevel::Info, message, fields);
    }

    fn error(&self, message: &str, fields: &Fields) {
        self.push(LogLevel::Error, message, fields);
    }
}
