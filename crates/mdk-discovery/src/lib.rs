//! Service resolution and discovery uplink client for the MDK runtime.
//!
//! Provides:
//! - `ResolutionEngine` - Deadline-bounded async resolution with shared subscriptions
//! - `UplinkClient` - Connection lifecycle, reconnects and registration replay
//! - `VersionReq` / `NodeSelector` - Version matching and load-spreading selection
//! - `MemoryUplink` - In-process discovery backend (feature: memory)

pub mod engine;
pub mod selector;
pub mod uplink;
pub mod version;

pub use engine::{PendingResolution, ResolutionEngine, ResolveError};
pub use selector::NodeSelector;
pub use uplink::{ClientOptions, UplinkClient, UplinkState};
pub use version::{Version, VersionReq};

#[cfg(feature = "memory")]
pub use uplink::MemoryUplink;
