//! Per-unit-of-work session facade.

use std::{
    fmt::Display,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use mdk_core::{
    CausalPath, Context, ContextPropagator, InteractionFailure, LogLevel, LogRecord, LogSink,
    Node, ServiceKey, TraceId,
};
use mdk_discovery::PendingResolution;
use serde::Serialize;

use crate::{Mdk, MdkError, blocking};

/// Category of the records a session writes about its own resolutions.
pub const RESOLUTION_CATEGORY: &str = "mdk";

/// A unit of work: trace identity, causal path and buffered log records,
/// bound to a shared `Mdk`.
///
/// One session is one logical thread of control; it is not meant to be
/// mutated from several tasks at once.
pub struct Session {
    mdk: Arc<Mdk>,
    context: Context,
}

impl Session {
    pub(crate) const fn new(mdk: Arc<Mdk>, context: Context) -> Self {
        Self { mdk, context }
    }

    #[must_use]
    pub const fn mdk(&self) -> &Arc<Mdk> {
        &self.mdk
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    #[must_use]
    pub const fn trace_id(&self) -> TraceId {
        self.context.trace_id()
    }

    #[must_use]
    pub fn causal_path(&self) -> CausalPath {
        self.context.causal_path()
    }

    /// Encode the current trace position for an outbound request.
    #[must_use]
    pub fn inject(&self) -> String {
        ContextPropagator::encode(&self.context.propagated())
    }

    // -- interactions --

    /// Start a nested interaction and return its sequence number.
    pub fn start_interaction(&mut self) -> u32 {
        self.context.start_interaction()
    }

    /// Finish the innermost interaction.
    ///
    /// # Errors
    /// Returns `InteractionStackUnderflow` if no interaction is open.
    pub fn finish_interaction(&mut self) -> Result<(), MdkError> {
        Ok(self.context.finish_interaction()?)
    }

    /// Run `body` inside a new interaction.
    ///
    /// The interaction is finished on every exit path. An `Err` from `body`
    /// is recorded with `fail` before finishing; a panic is recorded, the
    /// interaction finished, and the panic resumed.
    ///
    /// # Errors
    /// Returns the error from `body`, or `InteractionStackUnderflow` if
    /// `body` finished more interactions than it started.
    pub fn interact<T, E, F>(&mut self, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<MdkError> + Display,
    {
        self.start_interaction();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        self.close_interaction(outcome)
    }

    /// Async counterpart of `interact`.
    ///
    /// # Errors
    /// As for `interact`.
    pub async fn interact_async<T, E, F>(&mut self, body: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut Self) -> BoxFuture<'a, Result<T, E>>,
        E: From<MdkError> + Display,
    {
        self.start_interaction();
        let outcome = AssertUnwindSafe(body(self)).catch_unwind().await;
        self.close_interaction(outcome)
    }

    fn close_interaction<T, E>(&mut self, outcome: std::thread::Result<Result<T, E>>) -> Result<T, E>
    where
        E: From<MdkError> + Display,
    {
        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    self.fail(e.to_string());
                }
                self.finish_interaction()?;
                result
            }
            Err(payload) => {
                self.fail("interaction panicked");
                let _ = self.context.finish_interaction();
                panic::resume_unwind(payload)
            }
        }
    }

    // -- logging --

    pub fn debug(&mut self, category: impl Into<String>, text: impl Into<String>) {
        self.context.log(LogLevel::Debug, category, text);
    }

    pub fn info(&mut self, category: impl Into<String>, text: impl Into<String>) {
        self.context.log(LogLevel::Info, category, text);
    }

    pub fn warn(&mut self, category: impl Into<String>, text: impl Into<String>) {
        self.context.log(LogLevel::Warn, category, text);
    }

    pub fn error(&mut self, category: impl Into<String>, text: impl Into<String>) {
        self.context.log(LogLevel::Error, category, text);
    }

    pub fn critical(&mut self, category: impl Into<String>, text: impl Into<String>) {
        self.context.log(LogLevel::Critical, category, text);
    }

    /// Record that the current interaction failed.
    ///
    /// Never raises. Each call appends an ERROR record; the interaction is
    /// reported as failed once, with the latest message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.context.fail(message);
    }

    /// Whether the current interaction has failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.context.is_failed()
    }

    /// Drain buffered records into `sink`.
    pub fn flush(&mut self, sink: &mut dyn LogSink) {
        self.context.flush(sink);
    }

    /// Snapshot of buffered records and recorded failures.
    #[must_use]
    pub fn report(&self) -> SessionReport {
        SessionReport {
            trace_id: self.context.trace_id(),
            records: self.context.records().to_vec(),
            failures: self.context.failures().to_vec(),
        }
    }

    // -- resolution --

    /// Resolve `service` at `version`, waiting as long as it takes.
    ///
    /// # Errors
    /// `UplinkDisconnected`, `ServiceNotFound`, or `MdkStopped`.
    pub async fn resolve(&mut self, service: &str, version: &str) -> Result<Node, MdkError> {
        let result = self.resolve_async(service, version).await;
        self.log_resolution(service, version, &result);
        result
    }

    /// Resolve `service` at `version`, giving up after `timeout`.
    ///
    /// # Errors
    /// `ResolutionTimeout` on expiry, plus the failures of `resolve`.
    pub async fn resolve_until(
        &mut self,
        service: &str,
        version: &str,
        timeout: Duration,
    ) -> Result<Node, MdkError> {
        let key = ServiceKey::new(service, version);
        let result = self
            .mdk
            .engine()
            .resolve_until(key, timeout)
            .await
            .map_err(MdkError::from);
        self.log_resolution(service, version, &result);
        result
    }

    /// `resolve_until` with the configured default timeout.
    ///
    /// # Errors
    /// As for `resolve_until`.
    pub async fn resolve_default(&mut self, service: &str, version: &str) -> Result<Node, MdkError> {
        let timeout = self.mdk.default_timeout();
        self.resolve_until(service, version, timeout).await
    }

    /// Start resolving in the background and return a future for the result.
    ///
    /// Dropping the future cancels the lookup.
    ///
    /// # Panics
    /// Panics if the MDK was never started and no runtime is current.
    pub fn resolve_async(&self, service: &str, version: &str) -> Resolution {
        Resolution {
            pending: self
                .mdk
                .engine()
                .resolve_async(ServiceKey::new(service, version)),
        }
    }

    /// Blocking form of `resolve` for synchronous callers.
    ///
    /// Must not be called from a current-thread runtime's own thread.
    ///
    /// # Errors
    /// As for `resolve`.
    pub fn resolve_blocking(&mut self, service: &str, version: &str) -> Result<Node, MdkError> {
        blocking::block_on(self.resolve(service, version))
    }

    /// Blocking form of `resolve_until` for synchronous callers.
    ///
    /// # Errors
    /// As for `resolve_until`.
    pub fn resolve_until_blocking(
        &mut self,
        service: &str,
        version: &str,
        timeout: Duration,
    ) -> Result<Node, MdkError> {
        blocking::block_on(self.resolve_until(service, version, timeout))
    }

    fn log_resolution(&mut self, service: &str, version: &str, result: &Result<Node, MdkError>) {
        match result {
            Ok(node) => self.context.log(
                LogLevel::Debug,
                RESOLUTION_CATEGORY,
                format!("resolved {service} {version} -> {} ({})", node.address, node.version),
            ),
            Err(e) => self.context.log(
                LogLevel::Warn,
                RESOLUTION_CATEGORY,
                format!("failed to resolve {service} {version}: {e}"),
            ),
        };
    }
}

/// A resolution started with `Session::resolve_async`.
#[must_use = "dropping a Resolution cancels it"]
pub struct Resolution {
    pending: PendingResolution,
}

impl Resolution {
    /// Whether the lookup has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.pending.is_finished()
    }
}

impl Future for Resolution {
    type Output = Result<Node, MdkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.pending).poll(cx).map(|r| r.map_err(MdkError::from))
    }
}

/// What a session recorded, for an external reporter.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub trace_id: TraceId,
    pub records: Vec<LogRecord>,
    pub failures: Vec<InteractionFailure>,
}

impl SessionReport {
    /// Whether any interaction in the session failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
