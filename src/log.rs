//! Logging Infrastructure
//!
//! Structured, leveled logging for the runtime. Detection and epoch machinery
//! report through this module so that diagnostics survive even when the
//! hosting program has no logging of its own.
//!
//! # Features
//!
//! - **Log Levels**: Trace, Debug, Info, Warn, Error
//! - **Structured Fields**: key-value pairs on any entry
//! - **Output Formats**: plain text and JSON, stderr by default
//!
//! # Example
//!
//! ```rust,ignore
//! use rewind_runtime::log::{self, LogLevel};
//!
//! log::init_with_level(LogLevel::Debug);
//! log::warn("quarantine near capacity");
//! log::entry(LogLevel::Info, "epoch committed")
//!     .field_int("epoch", 7)
//!     .field_int("drained", 128)
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Get the level from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" => Some(LogLevel::Error),
            "off" | "none" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain text format (human readable).
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

/// A value in a structured log entry.
#[derive(Debug, Clone)]
pub enum LogValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Pointer-sized hexadecimal value.
    Hex(usize),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::String(s) => write!(f, "{}", s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::Bool(b) => write!(f, "{}", b),
            LogValue::Hex(v) => write!(f, "{:#x}", v),
        }
    }
}

impl LogValue {
    fn to_json(&self) -> String {
        match self {
            LogValue::String(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Int(i) => i.to_string(),
            LogValue::Bool(b) => b.to_string(),
            LogValue::Hex(v) => format!("\"{:#x}\"", v),
        }
    }
}

/// A log entry under construction.
#[derive(Debug)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured fields.
    pub fields: Vec<(String, LogValue)>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Thread name, if the thread has one.
    pub thread_name: Option<String>,
}

impl LogEntry {
    /// Create a new log entry at the given level.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            thread_name: std::thread::current().name().map(|s| s.to_string()),
        }
    }

    /// Add a string field.
    pub fn field_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), LogValue::String(value.into())));
        self
    }

    /// Add an integer field.
    pub fn field_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.fields.push((key.into(), LogValue::Int(value)));
        self
    }

    /// Add a boolean field.
    pub fn field_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.fields.push((key.into(), LogValue::Bool(value)));
        self
    }

    /// Add an address field, rendered in hexadecimal.
    pub fn field_addr(mut self, key: impl Into<String>, value: usize) -> Self {
        self.fields.push((key.into(), LogValue::Hex(value)));
        self
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = String::new();

        let secs = self.timestamp / 1000;
        let millis = self.timestamp % 1000;
        output.push_str(&format!("[{}.{:03}] ", secs, millis));
        output.push_str(&format!("{:<5} ", self.level.as_str()));

        if let Some(thread) = &self.thread_name {
            output.push_str(&format!("({}) ", thread));
        }

        output.push_str(&self.message);

        if !self.fields.is_empty() {
            output.push_str(" {");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push_str(", ");
                }
                output.push_str(&format!("{}={}", key, value));
            }
            output.push('}');
        }

        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = String::from("{");
        output.push_str(&format!("\"timestamp\":{}", self.timestamp));
        output.push_str(&format!(",\"level\":\"{}\"", self.level.as_str()));
        if let Some(thread) = &self.thread_name {
            output.push_str(&format!(",\"thread\":\"{}\"", escape_json(thread)));
        }
        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));
        if !self.fields.is_empty() {
            output.push_str(",\"fields\":{");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                output.push_str(&format!("\"{}\":{}", escape_json(key), value.to_json()));
            }
            output.push('}');
        }
        output.push('}');
        output
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }

    /// Emit this entry through the global logger.
    pub fn emit(self) {
        emit(&self);
    }
}

/// Escape a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Global logger state.
static LOGGER: OnceLock<Mutex<LoggerConfig>> = OnceLock::new();

/// Minimum log level (atomic for fast checking).
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Whether logging is enabled.
static ENABLED: AtomicBool = AtomicBool::new(true);

#[derive(Debug, Default)]
struct LoggerConfig {
    format: LogFormat,
}

fn get_logger() -> &'static Mutex<LoggerConfig> {
    LOGGER.get_or_init(|| Mutex::new(LoggerConfig::default()))
}

/// Initialize the logger with a specific level.
pub fn init_with_level(level: LogLevel) {
    set_level(level);
    let _ = get_logger();
}

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info)
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    if let Ok(mut config) = get_logger().lock() {
        config.format = format;
    }
}

/// Enable or disable logging entirely.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::SeqCst);
}

/// Check if a log level would be logged.
pub fn would_log(level: LogLevel) -> bool {
    ENABLED.load(Ordering::SeqCst)
        && level >= LogLevel::from_u8(MIN_LEVEL.load(Ordering::SeqCst)).unwrap_or(LogLevel::Info)
}

/// Emit a log entry.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }

    let output = {
        let config = match get_logger().lock() {
            Ok(c) => c,
            Err(_) => return,
        };
        entry.format(config.format)
    };

    let _ = writeln!(std::io::stderr(), "{}", output);
}

/// Start a structured log entry at the given level.
pub fn entry(level: LogLevel, message: impl Into<String>) -> LogEntry {
    LogEntry::new(level, message)
}

/// Log a message at the given level.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if !would_log(level) {
        return;
    }
    emit(&LogEntry::new(level, message));
}

/// Log a trace message.
pub fn trace(message: impl Into<String>) {
    log(LogLevel::Trace, message);
}

/// Log a debug message.
pub fn debug(message: impl Into<String>) {
    log(LogLevel::Debug, message);
}

/// Log an info message.
pub fn info(message: impl Into<String>) {
    log(LogLevel::Info, message);
}

/// Log a warning message.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}

/// Log an error message.
pub fn error(message: impl Into<String>) {
    log(LogLevel::Error, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Off);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("Info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("bogus"), None);
    }

    #[test]
    fn test_log_level_roundtrip() {
        for v in 0..=5u8 {
            let level = LogLevel::from_u8(v).unwrap();
            assert_eq!(level as u8, v);
        }
        assert_eq!(LogLevel::from_u8(42), None);
    }

    #[test]
    fn test_entry_format_plain() {
        let entry = LogEntry::new(LogLevel::Info, "overflow detected")
            .field_addr("addr", 0xdead_0000)
            .field_int("epoch", 3);
        let plain = entry.format_plain();
        assert!(plain.contains("INFO"));
        assert!(plain.contains("overflow detected"));
        assert!(plain.contains("addr=0xdead0000"));
        assert!(plain.contains("epoch=3"));
    }

    #[test]
    fn test_entry_format_json() {
        let entry = LogEntry::new(LogLevel::Error, "double free")
            .field_int("thread", 2)
            .field_bool("fatal", true);
        let json = entry.format_json();
        assert!(json.contains("\"level\":\"ERROR\""));
        assert!(json.contains("\"message\":\"double free\""));
        assert!(json.contains("\"thread\":2"));
        assert!(json.contains("\"fatal\":true"));
    }

    #[test]
    fn test_escape_json() {
        assert_eq!(escape_json("plain"), "plain");
        assert_eq!(escape_json("a\"b"), "a\\\"b");
        assert_eq!(escape_json("a\nb"), "a\\nb");
        assert_eq!(escape_json("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_would_log_respects_level() {
        let original = level();
        set_level(LogLevel::Warn);
        assert!(!would_log(LogLevel::Debug));
        assert!(would_log(LogLevel::Warn));
        assert!(would_log(LogLevel::Error));
        set_level(original);
    }
}
