//! Discovery uplink trait and the node types it exchanges.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A service instance known to discovery.
///
/// Resolution hands out snapshots of these; a node may go stale after it is
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Service name the node serves.
    pub service: String,
    /// Exact version the node runs.
    pub version: String,
    /// Address callers connect to, e.g. `host:port`.
    pub address: String,
}

impl Node {
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            address: address.into(),
        }
    }
}

/// A `(service, version)` lookup key. `version` may be a range expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Service name to look up.
    pub service: String,
    /// Exact version or version request (`^1.2`, `>=2.0`, `*`).
    pub version: String,
}

impl ServiceKey {
    #[must_use]
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.service, self.version)
    }
}

/// Update pushed by the uplink for a subscribed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkEvent {
    /// Full replacement of the known nodes for the key's service.
    Nodes(Vec<Node>),
    /// Discovery has no record of the service and will not get one.
    NotFound,
    /// The connection dropped; no further events follow.
    Disconnected,
}

/// A live view of one key: the current snapshot plus subsequent updates.
pub struct Subscription {
    pub initial: Vec<Node>,
    pub updates: BoxStream<'static, UplinkEvent>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

/// Uplink error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UplinkError {
    #[error("Uplink is not connected")]
    NotConnected,
    #[error("Transient uplink failure: {0}")]
    Transient(String),
    #[error("Fatal uplink failure: {0}")]
    Fatal(String),
}

impl UplinkError {
    /// Whether retrying can never succeed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Trait for discovery backends.
///
/// Implementations deliver updates eventually and in order per subscription.
/// Retrying registrations is the caller's job; see `UplinkClient`.
#[async_trait]
pub trait DiscoveryUplink: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<(), UplinkError>;

    /// Close the connection. Open subscriptions receive `Disconnected`.
    async fn disconnect(&self) -> Result<(), UplinkError>;

    /// Announce that this process serves `node`.
    async fn register(&self, node: &Node) -> Result<(), UplinkError>;

    /// Subscribe to the nodes of `key.service`.
    async fn subscribe(&self, key: &ServiceKey) -> Result<Subscription, UplinkError>;
}
