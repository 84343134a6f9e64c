//! Core abstractions for the MDK client runtime.
//!
//! This crate provides the fundamental building blocks:
//! - `Context` - Trace identity, causal path and buffered log records
//! - `InteractionStack` - Nested interaction tracking
//! - `ContextPropagator` - Opaque token encoding for cross-process propagation
//! - `LogRecord` / `LogSink` - Session log records and external sinks
//! - `DiscoveryUplink` - Trait for the external discovery backend

pub mod context;
pub mod interaction;
pub mod log_record;
pub mod propagation;
pub mod sink;
pub mod traits;

pub use context::{Context, InteractionFailure, TraceId};
pub use interaction::{CausalPath, InteractionError, InteractionStack};
pub use log_record::{LogLevel, LogRecord};
pub use propagation::{ContextPropagator, PropagatedContext, TokenError};
pub use sink::{LogSink, TracingSink};
pub use traits::{DiscoveryUplink, Node, ServiceKey, Subscription, UplinkError, UplinkEvent};
