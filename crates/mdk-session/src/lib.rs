//! MDK client runtime: service discovery, trace context propagation and
//! interaction-scoped logging.
//!
//! Provides:
//! - `Mdk` - Uplink lifecycle, service registration and session factory
//! - `Session` - Per-unit-of-work resolution, interactions and logging
//! - `MdkConfig` - Runtime configuration (environment or JSON)

mod blocking;
pub mod config;
pub mod error;
pub mod mdk;
pub mod session;

use std::sync::Arc;

pub use config::{ConfigError, MdkConfig};
pub use error::MdkError;
pub use mdk::Mdk;
pub use session::{RESOLUTION_CATEGORY, Resolution, Session, SessionReport};

pub use mdk_core::{
    CausalPath, DiscoveryUplink, InteractionFailure, LogLevel, LogRecord, LogSink, Node,
    ServiceKey, TraceId, TracingSink,
};
pub use mdk_discovery::UplinkState;

#[cfg(feature = "memory")]
pub use mdk_discovery::MemoryUplink;

/// Create an `Mdk` over `uplink`, configured from the environment.
///
/// The uplink is not connected; call `Mdk::start` or use `start`.
///
/// # Errors
/// Returns `Config` if an `MDK_*` variable is malformed.
pub fn init(uplink: Arc<dyn DiscoveryUplink>) -> Result<Arc<Mdk>, MdkError> {
    let config = MdkConfig::from_env()?;
    Ok(Mdk::new(config, uplink))
}

/// `init` followed by `Mdk::start`.
///
/// # Errors
/// As for `init` and `Mdk::start`.
pub async fn start(uplink: Arc<dyn DiscoveryUplink>) -> Result<Arc<Mdk>, MdkError> {
    let mdk = init(uplink)?;
    mdk.start().await?;
    Ok(mdk)
}
