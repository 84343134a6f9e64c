//! External destinations for buffered session records.

use crate::{LogLevel, LogRecord, TraceId};

/// Receives records drained from a session's context.
pub trait LogSink {
    /// Write a batch of records belonging to one trace, in append order.
    fn write(&mut self, trace_id: &TraceId, records: &[LogRecord]);
}

/// Replays session records as `tracing` events under the `mdk::session` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&mut self, trace_id: &TraceId, records: &[LogRecord]) {
        for record in records {
            let path = format!("{:?}", record.causal_path);
            match record.level {
                LogLevel::Debug => tracing::debug!(
                    target: "mdk::session",
                    %trace_id, causal_path = %path, category = %record.category,
                    "{}", record.text
                ),
                LogLevel::Info => tracing::info!(
                    target: "mdk::session",
                    %trace_id, causal_path = %path, category = %record.category,
                    "{}", record.text
                ),
                LogLevel::Warn => tracing::warn!(
                    target: "mdk::session",
                    %trace_id, causal_path = %path, category = %record.category,
                    "{}", record.text
                ),
                // tracing has no level above ERROR
                LogLevel::Error | LogLevel::Critical => tracing::error!(
                    target: "mdk::session",
                    %trace_id, causal_path = %path, category = %record.category,
                    critical = record.level == LogLevel::Critical,
                    "{}", record.text
                ),
            }
        }
    }
}
