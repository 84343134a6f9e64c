//! Trace context carried by a session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    CausalPath, InteractionError, InteractionStack, LogLevel, LogRecord, LogSink,
    PropagatedContext,
};

/// Category used for records written by `Context::fail`.
pub const FAILURE_CATEGORY: &str = "interaction";

/// Stable identifier shared by every session in one distributed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Generate a fresh trace identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A failed interaction, as recorded by `Context::fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionFailure {
    /// Causal path of the interaction that failed.
    pub causal_path: CausalPath,
    /// Latest failure message.
    pub message: String,
    /// Sequence number of the latest ERROR record for this interaction.
    pub record: u64,
}

/// Trace context: identity, causal position and buffered log records.
///
/// Appending is buffer-only; records leave the context through `flush`.
#[derive(Debug, Clone)]
pub struct Context {
    trace_id: TraceId,
    interactions: InteractionStack,
    log_buffer: Vec<LogRecord>,
    /// Sequence number of `log_buffer[0]`.
    flushed: u64,
    failures: Vec<InteractionFailure>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a root context with a fresh trace id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stack(TraceId::new(), InteractionStack::new())
    }

    /// Create a context continuing a propagated trace.
    #[must_use]
    pub fn continuing(propagated: PropagatedContext) -> Self {
        Self::with_stack(
            propagated.trace_id,
            InteractionStack::continuing(propagated.causal_path),
        )
    }

    fn with_stack(trace_id: TraceId, interactions: InteractionStack) -> Self {
        Self {
            trace_id,
            interactions,
            log_buffer: Vec::new(),
            flushed: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Causal path of the current interaction.
    #[must_use]
    pub fn causal_path(&self) -> CausalPath {
        self.interactions.path()
    }

    #[must_use]
    pub const fn interactions(&self) -> &InteractionStack {
        &self.interactions
    }

    /// Records appended and not yet flushed, in append order.
    #[must_use]
    pub fn records(&self) -> &[LogRecord] {
        &self.log_buffer
    }

    /// Every interaction that recorded a failure, in order of first failure.
    #[must_use]
    pub fn failures(&self) -> &[InteractionFailure] {
        &self.failures
    }

    /// Whether the current interaction has recorded a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.interactions.current_failure().is_some()
    }

    /// Snapshot of trace id and causal path for propagation.
    #[must_use]
    pub fn propagated(&self) -> PropagatedContext {
        PropagatedContext {
            trace_id: self.trace_id,
            causal_path: self.causal_path(),
        }
    }

    /// Start a nested interaction, returning its sequence number.
    pub fn start_interaction(&mut self) -> u32 {
        self.interactions.start()
    }

    /// Finish the innermost interaction.
    ///
    /// # Errors
    /// Returns `StackUnderflow` if no interaction is open.
    pub fn finish_interaction(&mut self) -> Result<(), InteractionError> {
        self.interactions.finish().map(|_| ())
    }

    /// Append a record at the current causal path and return its sequence.
    pub fn log(
        &mut self,
        level: LogLevel,
        category: impl Into<String>,
        text: impl Into<String>,
    ) -> u64 {
        let sequence = self.next_sequence();
        let record = LogRecord::new(sequence, level, category, text, self.causal_path());
        self.log_buffer.push(record);
        sequence
    }

    pub fn debug(&mut self, category: impl Into<String>, text: impl Into<String>) -> u64 {
        self.log(LogLevel::Debug, category, text)
    }

    pub fn info(&mut self, category: impl Into<String>, text: impl Into<String>) -> u64 {
        self.log(LogLevel::Info, category, text)
    }

    pub fn warn(&mut self, category: impl Into<String>, text: impl Into<String>) -> u64 {
        self.log(LogLevel::Warn, category, text)
    }

    pub fn error(&mut self, category: impl Into<String>, text: impl Into<String>) -> u64 {
        self.log(LogLevel::Error, category, text)
    }

    pub fn critical(&mut self, category: impl Into<String>, text: impl Into<String>) -> u64 {
        self.log(LogLevel::Critical, category, text)
    }

    /// Mark the current interaction as failed.
    ///
    /// Every call appends an ERROR record; records are never rewritten. The
    /// interaction is counted once in `failures`, and that entry tracks the
    /// latest message and the sequence of the latest ERROR record.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        let record = self.log(LogLevel::Error, FAILURE_CATEGORY, message.clone());

        match self.interactions.current_failure() {
            Some(index) => {
                let failure = &mut self.failures[index];
                failure.message = message;
                failure.record = record;
            }
            None => {
                self.failures.push(InteractionFailure {
                    causal_path: self.causal_path(),
                    message,
                    record,
                });
                self.interactions.mark_failed(self.failures.len() - 1);
            }
        }
    }

    /// Hand all buffered records to `sink` and clear the buffer.
    pub fn flush(&mut self, sink: &mut dyn LogSink) {
        if self.log_buffer.is_empty() {
            return;
        }
        sink.write(&self.trace_id, &self.log_buffer);
        self.flushed += self.log_buffer.len() as u64;
        self.log_buffer.clear();
    }

    fn next_sequence(&self) -> u64 {
        self.flushed + self.log_buffer.len() as u64
    }
}
