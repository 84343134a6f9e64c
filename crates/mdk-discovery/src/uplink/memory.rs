//! In-memory discovery backend.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use futures::StreamExt;
use mdk_core::{DiscoveryUplink, Node, ServiceKey, Subscription, UplinkError, UplinkEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

#[derive(Debug, Clone)]
enum Change {
    Service(String),
    Unknown(String),
    Disconnected,
}

#[derive(Default)]
struct Directory {
    connected: bool,
    services: HashMap<String, Vec<Node>>,
    unknown: HashSet<String>,
    connects: u32,
    refuse_connects: u32,
    fatal: Option<String>,
}

/// In-process discovery backend.
///
/// Useful for tests, demos and single-process deployments. The directory is
/// shared by every clone, so one clone can play the discovery server (via
/// `announce`, `withdraw`, `drop_connection`) while another is handed to an
/// `Mdk`.
#[derive(Clone)]
pub struct MemoryUplink {
    directory: Arc<RwLock<Directory>>,
    sender: broadcast::Sender<Change>,
}

impl MemoryUplink {
    /// Create an empty, disconnected directory.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            directory: Arc::new(RwLock::new(Directory::default())),
            sender,
        }
    }

    /// Add a node as if another process registered it.
    pub fn announce(&self, node: Node) {
        let mut dir = self.write();
        insert_node(&mut dir, node.clone());
        let _ = self.sender.send(Change::Service(node.service));
    }

    /// Remove the node at `address` from `service`.
    pub fn withdraw(&self, service: &str, address: &str) {
        let mut dir = self.write();
        if let Some(nodes) = dir.services.get_mut(service) {
            nodes.retain(|n| n.address != address);
        }
        let _ = self.sender.send(Change::Service(service.to_string()));
    }

    /// Tell subscribers discovery has no record of `service`.
    pub fn declare_unknown(&self, service: &str) {
        let mut dir = self.write();
        dir.services.remove(service);
        dir.unknown.insert(service.to_string());
        let _ = self.sender.send(Change::Unknown(service.to_string()));
    }

    /// Simulate a transport failure: every open subscription sees
    /// `Disconnected`.
    pub fn drop_connection(&self) {
        let mut dir = self.write();
        dir.connected = false;
        let _ = self.sender.send(Change::Disconnected);
    }

    /// Make the next `count` connects fail transiently.
    pub fn fail_next_connects(&self, count: u32) {
        self.write().refuse_connects = count;
    }

    /// Make every connect fail fatally with `reason`.
    pub fn fail_fatally(&self, reason: impl Into<String>) {
        self.write().fatal = Some(reason.into());
    }

    /// Nodes currently known for `service`.
    #[must_use]
    pub fn nodes(&self, service: &str) -> Vec<Node> {
        self.read().services.get(service).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.read().connected
    }

    /// Number of `connect` calls received, successful or not.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.read().connects
    }

    fn read(&self) -> RwLockReadGuard<'_, Directory> {
        self.directory.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Directory> {
        self.directory.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryUplink {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_node(dir: &mut Directory, node: Node) {
    dir.unknown.remove(&node.service);
    let nodes = dir.services.entry(node.service.clone()).or_default();
    if !nodes.contains(&node) {
        nodes.push(node);
    }
}

#[async_trait]
impl DiscoveryUplink for MemoryUplink {
    async fn connect(&self) -> Result<(), UplinkError> {
        let mut dir = self
            .directory
            .write()
            .map_err(|e| UplinkError::Fatal(e.to_string()))?;
        dir.connects += 1;
        if let Some(reason) = &dir.fatal {
            return Err(UplinkError::Fatal(reason.clone()));
        }
        if dir.refuse_connects > 0 {
            dir.refuse_connects -= 1;
            return Err(UplinkError::Transient("connection refused".to_string()));
        }
        dir.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), UplinkError> {
        self.drop_connection();
        Ok(())
    }

    async fn register(&self, node: &Node) -> Result<(), UplinkError> {
        let mut dir = self
            .directory
            .write()
            .map_err(|e| UplinkError::Fatal(e.to_string()))?;
        if !dir.connected {
            return Err(UplinkError::NotConnected);
        }
        insert_node(&mut dir, node.clone());
        let _ = self.sender.send(Change::Service(node.service.clone()));
        Ok(())
    }

    async fn subscribe(&self, key: &ServiceKey) -> Result<Subscription, UplinkError> {
        // Snapshot and receiver are taken under one lock so no change is missed.
        let dir = self
            .directory
            .read()
            .map_err(|e| UplinkError::Fatal(e.to_string()))?;
        if !dir.connected {
            return Err(UplinkError::NotConnected);
        }
        let rx = self.sender.subscribe();
        let initial = dir.services.get(&key.service).cloned().unwrap_or_default();
        let head = dir
            .unknown
            .contains(&key.service)
            .then_some(UplinkEvent::NotFound);
        drop(dir);

        let service = key.service.clone();
        let directory = Arc::clone(&self.directory);
        let live = BroadcastStream::new(rx).filter_map(move |res| {
            let event = match res {
                Ok(Change::Service(name)) if name == service => {
                    Some(UplinkEvent::Nodes(snapshot(&directory, &service)))
                }
                Ok(Change::Unknown(name)) if name == service => Some(UplinkEvent::NotFound),
                Ok(Change::Disconnected) => Some(UplinkEvent::Disconnected),
                Ok(_) => None,
                // Updates are full snapshots, so a lagging reader just resyncs.
                Err(BroadcastStreamRecvError::Lagged(_)) => {
                    Some(UplinkEvent::Nodes(snapshot(&directory, &service)))
                }
            };
            futures::future::ready(event)
        });

        Ok(Subscription {
            initial,
            updates: futures::stream::iter(head).chain(live).boxed(),
        })
    }
}

fn snapshot(directory: &RwLock<Directory>, service: &str) -> Vec<Node> {
    directory
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .services
        .get(service)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_requires_connection() {
        let uplink = MemoryUplink::new();
        let node = Node::new("svc", "1.0", "a:1");
        assert_eq!(uplink.register(&node).await, Err(UplinkError::NotConnected));

        uplink.connect().await.unwrap();
        uplink.register(&node).await.unwrap();
        uplink.register(&node).await.unwrap();
        assert_eq!(uplink.nodes("svc"), vec![node]);
    }

    #[tokio::test]
    async fn test_subscription_sees_snapshot_then_updates() {
        let uplink = MemoryUplink::new();
        uplink.connect().await.unwrap();
        uplink.announce(Node::new("svc", "1.0", "a:1"));
        uplink.announce(Node::new("other", "1.0", "x:1"));

        let mut sub = uplink.subscribe(&ServiceKey::new("svc", "1.0")).await.unwrap();
        assert_eq!(sub.initial.len(), 1);

        uplink.announce(Node::new("other", "1.0", "y:1"));
        uplink.announce(Node::new("svc", "1.1", "b:1"));
        let Some(UplinkEvent::Nodes(nodes)) = sub.updates.next().await else {
            panic!("expected a node update");
        };
        assert_eq!(nodes.len(), 2);

        uplink.declare_unknown("svc");
        assert_eq!(sub.updates.next().await, Some(UplinkEvent::NotFound));

        uplink.drop_connection();
        assert_eq!(sub.updates.next().await, Some(UplinkEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_subscribe_to_unknown_service_reports_not_found() {
        let uplink = MemoryUplink::new();
        uplink.connect().await.unwrap();
        uplink.declare_unknown("ghost");

        let mut sub = uplink
            .subscribe(&ServiceKey::new("ghost", "*"))
            .await
            .unwrap();
        assert!(sub.initial.is_empty());
        assert_eq!(sub.updates.next().await, Some(UplinkEvent::NotFound));
    }
}
