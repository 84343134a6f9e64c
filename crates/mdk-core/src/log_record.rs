//! Leveled, categorized session log records.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::CausalPath;

/// Severity of a session log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Returns the canonical upper-case name for the level.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// A single log record appended to a session's context.
///
/// Records are immutable values. The buffer that holds them may replace a
/// failure record wholesale (see `Context::fail`), but never edits one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Position of this record in the session's append order.
    pub sequence: u64,
    pub level: LogLevel,
    pub category: String,
    pub text: String,
    /// Wall-clock time of the append (Unix epoch milliseconds).
    pub timestamp: i64,
    /// Causal path of the interaction that was current at append time.
    pub causal_path: CausalPath,
}

impl LogRecord {
    pub(crate) fn new(
        sequence: u64,
        level: LogLevel,
        category: impl Into<String>,
        text: impl Into<String>,
        causal_path: CausalPath,
    ) -> Self {
        Self {
            sequence,
            level,
            category: category.into(),
            text: text.into(),
            timestamp: now_millis(),
            causal_path,
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse_and_display() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("CRITICAL".parse::<LogLevel>().unwrap(), LogLevel::Critical);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_levels_are_ordered_by_severity() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn test_record_serialization() {
        let record = LogRecord::new(3, LogLevel::Info, "http", "hello", vec![0, 1]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"INFO\""));

        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
