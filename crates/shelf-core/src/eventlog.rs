//! Structured operator event log with a size-rolling file sink.
//!
//! Records carry a timestamp, level, stable event id, message, and an
//! ordered key/value context tail. Sink failures never escape the logger:
//! a fallback writer receives one structured `logging_failure` line and
//! fallback failures are swallowed. Developer diagnostics stay on
//! `tracing`; this log is the operator-facing record of what the daemon
//! did.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Event and threshold levels, ordered. `None` is a threshold that
/// suppresses everything and is never a record level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Normal,
    Warning,
    Error,
    None,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

/// Context pairs attached to a record, in insertion order.
pub type LogContext<'a> = &'a [(&'a str, String)];

/// The logging seam components receive.
pub trait EventLog: Send + Sync {
    fn enabled(&self, level: LogLevel) -> bool;

    fn emit(&self, level: LogLevel, event_id: &str, message: &str, context: LogContext<'_>);

    fn trace(&self, event_id: &str, message: &str, context: LogContext<'_>) {
        self.emit(LogLevel::Trace, event_id, message, context);
    }

    fn debug(&self, event_id: &str, message: &str, context: LogContext<'_>) {
        self.emit(LogLevel::Debug, event_id, message, context);
    }

    fn normal(&self, event_id: &str, message: &str, context: LogContext<'_>) {
        self.emit(LogLevel::Normal, event_id, message, context);
    }

    fn warning(&self, event_id: &str, message: &str, context: LogContext<'_>) {
        self.emit(LogLevel::Warning, event_id, message, context);
    }

    fn error(&self, event_id: &str, message: &str, context: LogContext<'_>) {
        self.emit(LogLevel::Error, event_id, message, context);
    }
}

/// A line-oriented sink. Implementations must be safe to call from any
/// task; ordering is preserved per sink by the logger's own lock.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str) -> std::io::Result<()>;
}

/// Replace characters outside `[A-Za-z0-9_]` in a context key.
fn sanitize_key(key: &str) -> String {
    if key.is_empty() {
        return "_".to_string();
    }
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Escape quotes, backslashes, and line breaks in a context value.
fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Render one record. Exposed for sink-independent format tests.
pub fn format_record(
    ts: DateTime<Utc>,
    level: LogLevel,
    event_id: &str,
    message: &str,
    context: LogContext<'_>,
) -> String {
    let mut line = format!(
        "{} {} {} {}",
        ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        level.as_str(),
        event_id,
        message,
    );
    for (key, value) in context {
        let _ = write!(line, " {}='{}'", sanitize_key(key), escape_value(value));
    }
    line
}

/// The process-wide logger: threshold gate, ordered sinks, fallback.
pub struct EventLogger {
    threshold: LogLevel,
    sinks: Vec<Box<dyn LogSink>>,
    fallback: Box<dyn LogSink>,
    // Serializes emission so every sink sees records in insertion order.
    order: Mutex<()>,
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("threshold", &self.threshold)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl EventLogger {
    pub fn new(threshold: LogLevel, sinks: Vec<Box<dyn LogSink>>) -> Self {
        Self {
            threshold,
            sinks,
            fallback: Box::new(StderrSink),
            order: Mutex::new(()),
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn LogSink>) -> Self {
        self.fallback = fallback;
        self
    }
}

impl EventLog for EventLogger {
    fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None && self.threshold != LogLevel::None && level >= self.threshold
    }

    fn emit(&self, level: LogLevel, event_id: &str, message: &str, context: LogContext<'_>) {
        debug_assert!(!event_id.is_empty(), "event_id must be non-empty");
        debug_assert!(!message.is_empty(), "message must be non-empty");
        if !self.enabled(level) {
            return;
        }
        let event_id = if event_id.is_empty() { "unspecified" } else { event_id };
        let message = if message.is_empty() { "unspecified" } else { message };
        let line = format_record(Utc::now(), level, event_id, message, context);

        let _order = self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for sink in &self.sinks {
            if let Err(err) = sink.write_line(&line) {
                let fallback_line = format_record(
                    Utc::now(),
                    LogLevel::Error,
                    "logging_failure",
                    "log sink write failed",
                    &[
                        ("error", err.to_string()),
                        ("dropped_event_id", event_id.to_string()),
                    ],
                );
                let _ = self.fallback.write_line(&fallback_line);
            }
        }
    }
}

/// Fallback writer of last resort.
#[derive(Debug)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{line}")
    }
}

/// Append-only file sink that rotates by size.
///
/// When a write would push the file past `max_bytes`, the file is rotated
/// to `<name>.1`, shifting older generations up to `<name>.<retained>`;
/// the oldest generation is deleted. `retained == 0` truncates in place.
pub struct RollingFileSink {
    path: PathBuf,
    max_bytes: u64,
    retained: u32,
    file: Mutex<Option<File>>,
}

impl std::fmt::Debug for RollingFileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingFileSink")
            .field("path", &self.path)
            .field("max_bytes", &self.max_bytes)
            .field("retained", &self.retained)
            .finish_non_exhaustive()
    }
}

impl RollingFileSink {
    pub fn new(path: PathBuf, max_bytes: u64, retained: u32) -> Self {
        Self {
            path,
            max_bytes,
            retained,
            file: Mutex::new(None),
        }
    }

    fn generation_path(&self, generation: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{generation}"));
        PathBuf::from(name)
    }

    fn open_append(path: &Path) -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn rotate(&self) -> std::io::Result<File> {
        if self.retained == 0 {
            return OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path);
        }
        let _ = std::fs::remove_file(self.generation_path(self.retained));
        for generation in (1..self.retained).rev() {
            let _ = std::fs::rename(
                self.generation_path(generation),
                self.generation_path(generation + 1),
            );
        }
        let _ = std::fs::rename(&self.path, self.generation_path(1));
        Self::open_append(&self.path)
    }
}

impl LogSink for RollingFileSink {
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(Self::open_append(&self.path)?);
        }
        let needs_rotate = {
            let file = guard.as_ref().expect("file opened above");
            let current = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.max_bytes > 0 && current + line.len() as u64 + 1 > self.max_bytes && current > 0
        };
        if needs_rotate {
            *guard = Some(self.rotate()?);
        }
        let file = guard.as_mut().expect("file opened above");
        writeln!(file, "{line}")
    }
}

/// Captured record, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: LogLevel,
    pub event_id: String,
    pub message: String,
    pub context: Vec<(String, String)>,
}

/// In-memory log used across the workspace's tests.
#[derive(Debug, Default)]
pub struct CapturingLog {
    records: Mutex<Vec<CapturedRecord>>,
}

impl CapturingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn with_id(&self, event_id: &str) -> Vec<CapturedRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.event_id == event_id)
            .collect()
    }

    pub fn contains_id(&self, event_id: &str) -> bool {
        !self.with_id(event_id).is_empty()
    }
}

impl EventLog for CapturingLog {
    fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::None
    }

    fn emit(&self, level: LogLevel, event_id: &str, message: &str, context: LogContext<'_>) {
        if level == LogLevel::None {
            return;
        }
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.push(CapturedRecord {
            level,
            event_id: event_id.to_string(),
            message: message.to_string(),
            context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
    }
}

/// Log that discards everything.
#[derive(Debug, Default)]
pub struct NullLog;

impl EventLog for NullLog {
    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }

    fn emit(&self, _level: LogLevel, _event_id: &str, _message: &str, _context: LogContext<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Default, Clone)]
    struct SharedLines(Arc<Mutex<Vec<String>>>);

    impl SharedLines {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl LogSink for SharedLines {
        fn write_line(&self, line: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingSink;

    impl LogSink for FailingSink {
        fn write_line(&self, _line: &str) -> std::io::Result<()> {
            Err(std::io::Error::other("sink broken"))
        }
    }

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-01T10:00:00.123Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn level_order_is_total() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Normal);
        assert!(LogLevel::Normal < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::None);
    }

    #[test]
    fn format_includes_ordered_context_tail() {
        let line = format_record(
            ts(),
            LogLevel::Warning,
            "watch.overflow",
            "event buffer overflow",
            &[
                ("dropped_events", "7".to_string()),
                ("policy", "drop_oldest".to_string()),
            ],
        );
        assert_eq!(
            line,
            "2026-08-01T10:00:00.123Z warning watch.overflow event buffer overflow \
             dropped_events='7' policy='drop_oldest'"
        );
    }

    #[test]
    fn context_keys_are_sanitized_and_values_escaped() {
        let line = format_record(
            ts(),
            LogLevel::Error,
            "id",
            "msg",
            &[("bad key!", "line1\nline2 'quoted'".to_string())],
        );
        assert!(line.contains("bad_key_='line1\\nline2 \\'quoted\\''"), "{line}");
    }

    #[test]
    fn threshold_gates_lower_levels() {
        let sink = SharedLines::default();
        let logger = EventLogger::new(LogLevel::Warning, vec![Box::new(sink.clone())]);
        logger.debug("a", "below threshold", &[]);
        logger.warning("b", "at threshold", &[]);
        logger.error("c", "above threshold", &[]);
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" b "));
        assert!(lines[1].contains(" c "));
    }

    #[test]
    fn none_threshold_suppresses_everything() {
        let sink = SharedLines::default();
        let logger = EventLogger::new(LogLevel::None, vec![Box::new(sink.clone())]);
        logger.error("x", "never shown", &[]);
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn sink_failure_reaches_fallback_and_does_not_propagate() {
        let fallback = SharedLines::default();
        let logger = EventLogger::new(LogLevel::Trace, vec![Box::new(FailingSink)])
            .with_fallback(Box::new(fallback.clone()));
        logger.error("ev", "message", &[]);
        let lines = fallback.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("logging_failure"), "{}", lines[0]);
        assert!(lines[0].contains("dropped_event_id='ev'"), "{}", lines[0]);
    }

    #[test]
    fn rolling_sink_rotates_and_retains() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shelfd.log");
        let sink = RollingFileSink::new(path.clone(), 64, 2);
        for i in 0..20 {
            sink.write_line(&format!("record number {i:04} with some padding"))
                .unwrap();
        }
        assert!(path.exists());
        assert!(dir.path().join("shelfd.log.1").exists());
        assert!(dir.path().join("shelfd.log.2").exists());
        assert!(!dir.path().join("shelfd.log.3").exists());
    }

    #[test]
    fn rolling_sink_preserves_order_within_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("order.log");
        let sink = RollingFileSink::new(path.clone(), 0, 0);
        for i in 0..5 {
            sink.write_line(&format!("line-{i}")).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["line-0", "line-1", "line-2", "line-3", "line-4"]);
    }
}
