//! Asynchronous service resolution.
//!
//! The engine keeps one subscription per `(service, version)` key and a set of
//! pending waiters per key. Known nodes and waiters for a key live behind a
//! single lock, so a node arriving and a waiter being added are observed in a
//! consistent order: either the waiter sees the node on entry, or the update
//! sees the waiter.

use std::{
    collections::HashMap,
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use mdk_core::{Node, ServiceKey, UplinkEvent};
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, oneshot},
    task::JoinHandle,
    time::{Instant, timeout_at},
};

use crate::{NodeSelector, UplinkClient, VersionReq};

/// Resolution error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Timed out resolving {0}")]
    Timeout(ServiceKey),
    #[error("Uplink disconnected")]
    UplinkDisconnected,
    #[error("Service not found: {0}")]
    NotFound(ServiceKey),
    #[error("Resolution engine stopped")]
    Stopped,
}

type Outcome = Result<Node, ResolveError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Outcome>,
}

struct KeyEntry {
    request: VersionReq,
    nodes: Vec<Node>,
    not_found: bool,
    waiters: Vec<Waiter>,
    pump: JoinHandle<()>,
}

struct EngineState {
    stopped: bool,
    /// Bumped whenever the key table is dropped after a disconnect.
    epoch: u64,
    next_waiter: u64,
    keys: HashMap<ServiceKey, KeyEntry>,
}

struct Inner {
    client: Arc<UplinkClient>,
    selector: NodeSelector,
    state: Mutex<EngineState>,
    /// Per-key setup locks, so concurrent first lookups of a key share one
    /// subscription without holding up other keys.
    subscribing: Mutex<HashMap<ServiceKey, Arc<AsyncMutex<()>>>>,
}

/// Resolves service keys against the live uplink view.
#[derive(Clone)]
pub struct ResolutionEngine {
    inner: Arc<Inner>,
}

impl ResolutionEngine {
    /// Create an engine resolving through `client`.
    #[must_use]
    pub fn new(client: Arc<UplinkClient>, selector: NodeSelector) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                selector,
                state: Mutex::new(EngineState {
                    stopped: false,
                    epoch: 0,
                    next_waiter: 0,
                    keys: HashMap::new(),
                }),
                subscribing: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start resolving `key` without waiting for the result.
    ///
    /// The lookup runs in the background; dropping the returned future
    /// cancels it and withdraws its waiter.
    ///
    /// # Panics
    /// Panics if the uplink client was never started and no runtime is current.
    pub fn resolve_async(&self, key: ServiceKey) -> PendingResolution {
        self.spawn(key, None)
    }

    /// Resolve `key`, waiting as long as it takes.
    ///
    /// # Errors
    /// Fails if the uplink disconnects, reports the service as not found, or
    /// the engine is shut down.
    pub async fn resolve(&self, key: ServiceKey) -> Outcome {
        self.resolve_async(key).await
    }

    /// Resolve `key`, giving up after `timeout`.
    ///
    /// The deadline is fixed on entry. A zero timeout never waits: it
    /// succeeds only if a matching node is already known.
    ///
    /// # Errors
    /// Returns `Timeout` when the deadline passes, plus the failures of
    /// `resolve`.
    pub async fn resolve_until(&self, key: ServiceKey, timeout: Duration) -> Outcome {
        let deadline = Instant::now() + timeout;
        self.spawn(key, Some(deadline)).await
    }

    /// Stop the engine: fail every pending waiter with `UplinkDisconnected`
    /// and refuse later lookups with `Stopped`.
    ///
    /// Returns the number of waiters failed.
    pub fn shutdown(&self) -> usize {
        let failed = self.inner.drain(ResolveError::UplinkDisconnected, None, true);
        tracing::info!(failed, "Resolution engine stopped");
        failed
    }

    /// Number of callers currently waiting on `key`.
    #[must_use]
    pub fn pending_waiters(&self, key: &ServiceKey) -> usize {
        self.inner
            .lock()
            .keys
            .get(key)
            .map_or(0, |entry| entry.waiters.len())
    }

    /// Latest nodes the engine knows for `key`'s service.
    #[must_use]
    pub fn known_nodes(&self, key: &ServiceKey) -> Vec<Node> {
        self.inner
            .lock()
            .keys
            .get(key)
            .map(|entry| entry.nodes.clone())
            .unwrap_or_default()
    }

    fn spawn(&self, key: ServiceKey, deadline: Option<Instant>) -> PendingResolution {
        let inner = Arc::clone(&self.inner);
        let handle = self.inner.client.spawn(async move {
            match deadline {
                Some(deadline) => timeout_at(deadline, Arc::clone(&inner).wait(key.clone()))
                    .await
                    .unwrap_or_else(|_| {
                        tracing::debug!(%key, "Resolution timed out");
                        Err(ResolveError::Timeout(key))
                    }),
                None => inner.wait(key).await,
            }
        });
        PendingResolution { handle }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait(self: Arc<Self>, key: ServiceKey) -> Outcome {
        self.ensure_subscribed(&key).await?;

        let (id, rx) = {
            let mut state = self.lock();
            if state.stopped {
                return Err(ResolveError::Stopped);
            }
            let id = state.next_waiter;
            state.next_waiter += 1;

            // Dropped by a disconnect between subscribing and here.
            let Some(entry) = state.keys.get_mut(&key) else {
                return Err(ResolveError::UplinkDisconnected);
            };
            if let Some(node) = self.select(entry) {
                return Ok(node);
            }
            if entry.not_found {
                return Err(ResolveError::NotFound(key));
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(Waiter { id, tx });
            (id, rx)
        };

        let _registration = WaiterGuard {
            engine: &self,
            key: &key,
            id,
        };
        rx.await.unwrap_or(Err(ResolveError::UplinkDisconnected))
    }

    async fn ensure_subscribed(self: &Arc<Self>, key: &ServiceKey) -> Result<(), ResolveError> {
        if self.check_subscribed(key)? {
            return Ok(());
        }
        let setup = self.setup_lock(key);
        let _setup = setup.lock().await;
        if self.check_subscribed(key)? {
            return Ok(());
        }

        let subscription = self.client.subscribe(key).await.map_err(|e| {
            tracing::warn!(%key, error = %e, "Subscription failed");
            ResolveError::UplinkDisconnected
        })?;

        let mut state = self.lock();
        if state.stopped {
            return Err(ResolveError::Stopped);
        }
        let pump = self.client.spawn(pump_updates(
            Arc::downgrade(self),
            key.clone(),
            state.epoch,
            subscription.updates,
        ));
        tracing::debug!(%key, known = subscription.initial.len(), "Subscribed");
        state.keys.insert(
            key.clone(),
            KeyEntry {
                request: VersionReq::parse(&key.version),
                nodes: subscription.initial,
                not_found: false,
                waiters: Vec::new(),
                pump,
            },
        );
        Ok(())
    }

    fn setup_lock(&self, key: &ServiceKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .subscribing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn check_subscribed(&self, key: &ServiceKey) -> Result<bool, ResolveError> {
        let state = self.lock();
        if state.stopped {
            return Err(ResolveError::Stopped);
        }
        Ok(state.keys.contains_key(key))
    }

    fn select(&self, entry: &KeyEntry) -> Option<Node> {
        let candidates = entry.request.best_candidates(&entry.nodes);
        self.selector.pick(&candidates).cloned()
    }

    /// Replace the known nodes for `key` and wake satisfiable waiters.
    fn apply_nodes(&self, key: &ServiceKey, nodes: Vec<Node>) {
        let mut state = self.lock();
        let Some(entry) = state.keys.get_mut(key) else {
            return;
        };
        entry.nodes = nodes;
        entry.not_found = false;
        if entry.waiters.is_empty() {
            return;
        }

        let candidates = entry.request.best_candidates(&entry.nodes);
        if candidates.is_empty() {
            return;
        }
        let waiters = mem::take(&mut entry.waiters);
        tracing::debug!(%key, woken = waiters.len(), "Resolved pending waiters");
        for waiter in waiters {
            if let Some(node) = self.selector.pick(&candidates) {
                let _ = waiter.tx.send(Ok(node.clone()));
            }
        }
    }

    fn apply_not_found(&self, key: &ServiceKey) {
        let mut state = self.lock();
        let Some(entry) = state.keys.get_mut(key) else {
            return;
        };
        entry.nodes.clear();
        entry.not_found = true;
        for waiter in mem::take(&mut entry.waiters) {
            let _ = waiter.tx.send(Err(ResolveError::NotFound(key.clone())));
        }
    }

    /// Drop the key table and fail every waiter with `error`.
    ///
    /// With `epoch` set, does nothing unless the table still belongs to that
    /// epoch.
    fn drain(&self, error: ResolveError, epoch: Option<u64>, stop: bool) -> usize {
        let keys = {
            let mut state = self.lock();
            if epoch.is_some_and(|e| e != state.epoch) {
                return 0;
            }
            state.epoch += 1;
            state.stopped |= stop;
            mem::take(&mut state.keys)
        };

        let mut failed = 0;
        for entry in keys.into_values() {
            entry.pump.abort();
            for waiter in entry.waiters {
                let _ = waiter.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    fn connection_lost(&self, epoch: u64) {
        let failed = self.drain(ResolveError::UplinkDisconnected, Some(epoch), false);
        tracing::warn!(failed, "Uplink disconnected, failed pending resolutions");
        self.client.connection_lost();
    }

    fn remove_waiter(&self, key: &ServiceKey, id: u64) {
        if let Some(entry) = self.lock().keys.get_mut(key) {
            entry.waiters.retain(|w| w.id != id);
        }
    }
}

async fn pump_updates(
    engine: Weak<Inner>,
    key: ServiceKey,
    epoch: u64,
    mut updates: BoxStream<'static, UplinkEvent>,
) {
    while let Some(event) = updates.next().await {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        match event {
            UplinkEvent::Nodes(nodes) => engine.apply_nodes(&key, nodes),
            UplinkEvent::NotFound => engine.apply_not_found(&key),
            UplinkEvent::Disconnected => break,
        }
    }
    if let Some(engine) = engine.upgrade() {
        engine.connection_lost(epoch);
    }
}

/// Withdraws a waiter when its lookup ends early (deadline or drop).
struct WaiterGuard<'a> {
    engine: &'a Inner,
    key: &'a ServiceKey,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.engine.remove_waiter(self.key, self.id);
    }
}

/// A resolution running in the background.
///
/// Await it for the result. Dropping it cancels the lookup.
#[must_use = "dropping a PendingResolution cancels it"]
pub struct PendingResolution {
    handle: JoinHandle<Outcome>,
}

impl PendingResolution {
    /// Whether the lookup has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingResolution {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or(Err(ResolveError::Stopped)))
    }
}

impl Drop for PendingResolution {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use async_trait::async_trait;
    use mdk_core::{DiscoveryUplink, Subscription, UplinkError};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::{ClientOptions, MemoryUplink};

    /// Memory uplink whose subscriptions to one service take a while.
    struct SlowUplink {
        inner: MemoryUplink,
        slow: &'static str,
    }

    #[async_trait]
    impl DiscoveryUplink for SlowUplink {
        async fn connect(&self) -> Result<(), UplinkError> {
            self.inner.connect().await
        }

        async fn disconnect(&self) -> Result<(), UplinkError> {
            self.inner.disconnect().await
        }

        async fn register(&self, node: &Node) -> Result<(), UplinkError> {
            self.inner.register(node).await
        }

        async fn subscribe(&self, key: &ServiceKey) -> Result<Subscription, UplinkError> {
            if key.service == self.slow {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.inner.subscribe(key).await
        }
    }

    async fn engine_with(uplink: &MemoryUplink) -> (ResolutionEngine, Arc<UplinkClient>) {
        let client = UplinkClient::new(Arc::new(uplink.clone()), ClientOptions::default());
        client.start().await.unwrap();
        (
            ResolutionEngine::new(Arc::clone(&client), NodeSelector::seeded(3)),
            client,
        )
    }

    fn key() -> ServiceKey {
        ServiceKey::new("billing", "1.0")
    }

    #[tokio::test]
    async fn test_known_node_resolves_immediately() {
        let uplink = MemoryUplink::new();
        uplink.announce(Node::new("billing", "1.0", "10.0.0.1:80"));
        let (engine, _client) = engine_with(&uplink).await;

        let node = engine.resolve_until(key(), Duration::ZERO).await.unwrap();
        assert_eq!(node.address, "10.0.0.1:80");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_with_no_nodes_fails_without_waiting() {
        let uplink = MemoryUplink::new();
        let (engine, _client) = engine_with(&uplink).await;

        let started = Instant::now();
        let err = assert_err!(engine.resolve_until(key(), Duration::ZERO).await);
        assert_eq!(err, ResolveError::Timeout(key()));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(engine.pending_waiters(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_a_late_arrival() {
        let uplink = MemoryUplink::new();
        let (engine, _client) = engine_with(&uplink).await;
        let started = Instant::now();

        let a = engine.resolve_until(key(), Duration::from_secs(5));
        let b = engine.resolve_until(key(), Duration::from_secs(5));
        let announcer = uplink.clone();
        let arrive = async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            announcer.announce(Node::new("billing", "1.0", "10.0.0.9:80"));
        };

        let (a, b, ()) = tokio::join!(a, b, arrive);
        assert_eq!(a.unwrap().address, "10.0.0.9:80");
        assert_eq!(b.unwrap().address, "10.0.0.9:80");
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_removes_only_the_expired_waiter() {
        let uplink = MemoryUplink::new();
        let (engine, _client) = engine_with(&uplink).await;

        let patient = engine.resolve_async(key());
        let hasty = engine.resolve_until(key(), Duration::from_millis(100));
        assert_eq!(hasty.await, Err(ResolveError::Timeout(key())));
        assert_eq!(engine.pending_waiters(&key()), 1);

        uplink.announce(Node::new("billing", "1.0", "10.0.0.2:80"));
        assert_eq!(patient.await.unwrap().address, "10.0.0.2:80");
    }

    #[tokio::test]
    async fn test_range_waiter_satisfied_by_later_version() {
        let uplink = MemoryUplink::new();
        uplink.announce(Node::new("billing", "1.9", "old:80"));
        let (engine, _client) = engine_with(&uplink).await;
        let wanted = ServiceKey::new("billing", ">=2.0");

        let pending = engine.resolve_async(wanted.clone());
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        assert_eq!(engine.pending_waiters(&wanted), 1);

        uplink.announce(Node::new("billing", "2.1", "new:80"));
        let node = assert_ok!(pending.await);
        assert_eq!(node.version, "2.1");
        assert_eq!(engine.known_nodes(&wanted).len(), 2);
    }

    #[tokio::test]
    async fn test_highest_matching_version_wins() {
        let uplink = MemoryUplink::new();
        uplink.announce(Node::new("billing", "1.2", "a:80"));
        uplink.announce(Node::new("billing", "1.8", "b:80"));
        uplink.announce(Node::new("billing", "2.0", "c:80"));
        let (engine, _client) = engine_with(&uplink).await;

        let node = engine
            .resolve_until(ServiceKey::new("billing", "^1.0"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(node.address, "b:80");
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_waiters() {
        let uplink = MemoryUplink::new();
        let (engine, client) = engine_with(&uplink).await;

        let pending = engine.resolve_async(key());
        tokio::task::yield_now().await;
        uplink.drop_connection();

        assert_eq!(pending.await, Err(ResolveError::UplinkDisconnected));
        assert_ne!(client.state(), crate::UplinkState::Stopped);
    }

    #[tokio::test]
    async fn test_not_found_fails_blocking_resolve() {
        let uplink = MemoryUplink::new();
        let (engine, _client) = engine_with(&uplink).await;

        let pending = engine.resolve_async(key());
        tokio::task::yield_now().await;
        uplink.declare_unknown("billing");

        assert_eq!(pending.await, Err(ResolveError::NotFound(key())));
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_then_refuses() {
        let uplink = MemoryUplink::new();
        let (engine, _client) = engine_with(&uplink).await;

        let pending = engine.resolve_async(key());
        tokio::task::yield_now().await;
        assert_eq!(engine.shutdown(), 1);
        assert_eq!(pending.await, Err(ResolveError::UplinkDisconnected));
        assert_eq!(engine.resolve(key()).await, Err(ResolveError::Stopped));
    }

    #[tokio::test]
    async fn test_dropping_pending_resolution_withdraws_waiter() {
        let uplink = MemoryUplink::new();
        let (engine, _client) = engine_with(&uplink).await;

        let pending = engine.resolve_async(key());
        tokio::task::yield_now().await;
        assert_eq!(engine.pending_waiters(&key()), 1);

        drop(pending);
        tokio::task::yield_now().await;
        assert_eq!(engine.pending_waiters(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscription_does_not_hold_up_other_keys() {
        let uplink = MemoryUplink::new();
        uplink.announce(Node::new("billing", "1.0", "a:80"));
        let slow = SlowUplink {
            inner: uplink.clone(),
            slow: "reports",
        };
        let client = UplinkClient::new(Arc::new(slow), ClientOptions::default());
        client.start().await.unwrap();
        let engine = ResolutionEngine::new(Arc::clone(&client), NodeSelector::seeded(3));

        let stuck = engine.resolve_async(ServiceKey::new("reports", "1.0"));
        tokio::task::yield_now().await;
        assert!(!stuck.is_finished());

        let started = Instant::now();
        let node = assert_ok!(engine.resolve_until(key(), Duration::ZERO).await);
        assert_eq!(node.address, "a:80");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_ready_resolution_reports_finished() {
        let uplink = MemoryUplink::new();
        uplink.announce(Node::new("billing", "1.0", "a:80"));
        let (engine, _client) = engine_with(&uplink).await;

        let pending = engine.resolve_async(key());
        tokio::task::yield_now().await;
        assert!(pending.is_finished());
        assert_eq!(assert_ok!(pending.await).address, "a:80");
    }
}
