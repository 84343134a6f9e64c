//! Connection lifecycle and registration replay on top of a `DiscoveryUplink`.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use mdk_core::{DiscoveryUplink, Node, ServiceKey, Subscription, UplinkError};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};

/// Connection state of the uplink client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the client was stopped and will not reconnect.
    Stopped,
}

/// Connection and retry tuning.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on a single `connect()` attempt.
    pub connect_timeout: Duration,
    /// Attempts made by `start()` before giving up.
    pub connect_attempts: u32,
    /// Initial delay between reconnect or retry attempts; doubles each time.
    pub backoff: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_max: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            backoff: Duration::from_millis(250),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl ClientOptions {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.backoff_max)
    }
}

/// Owns the uplink connection on behalf of one `Mdk`.
///
/// Registrations are remembered and replayed after every successful
/// (re)connect, so delivery is at-least-once across transient disconnects.
pub struct UplinkClient {
    uplink: Arc<dyn DiscoveryUplink>,
    options: ClientOptions,
    state: watch::Sender<UplinkState>,
    registrations: Mutex<Vec<Node>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Runtime `start()` ran on; background work is pinned to it.
    runtime: OnceLock<Handle>,
}

impl UplinkClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(uplink: Arc<dyn DiscoveryUplink>, options: ClientOptions) -> Arc<Self> {
        let (state, _) = watch::channel(UplinkState::Disconnected);
        Arc::new(Self {
            uplink,
            options,
            state,
            registrations: Mutex::new(Vec::new()),
            reconnect: Mutex::new(None),
            runtime: OnceLock::new(),
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> UplinkState {
        *self.state.borrow()
    }

    /// Receiver for connection state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<UplinkState> {
        self.state.subscribe()
    }

    /// Services registered through this client.
    #[must_use]
    pub fn registrations(&self) -> Vec<Node> {
        lock(&self.registrations).clone()
    }

    /// Connect, retrying transient failures.
    ///
    /// Returns once the client is `Connected`, or with the error that made it
    /// give up.
    ///
    /// # Errors
    /// Returns error on a fatal uplink failure, when all attempts are
    /// exhausted, or when the client has been stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), UplinkError> {
        match self.state() {
            UplinkState::Connected => return Ok(()),
            UplinkState::Stopped => {
                return Err(UplinkError::Fatal("uplink client stopped".to_string()));
            }
            UplinkState::Disconnected | UplinkState::Connecting => {}
        }
        let _ = self.runtime.set(Handle::current());
        self.transition(UplinkState::Connecting);

        let attempts = self.options.connect_attempts.max(1);
        let mut last_error = UplinkError::NotConnected;
        for attempt in 1..=attempts {
            match self.connect_once().await {
                Ok(()) => {
                    if !self.transition(UplinkState::Connected) {
                        return Err(UplinkError::Fatal("uplink client stopped".to_string()));
                    }
                    tracing::info!(attempt, "Uplink connected");
                    self.replay_registrations().await;
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(attempt, error = %e, "Uplink connect failed fatally");
                    self.transition(UplinkState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Uplink connect failed");
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.backoff_for(attempt)).await;
            }
        }

        self.transition(UplinkState::Disconnected);
        Err(last_error)
    }

    /// Record a registration and deliver it in the background.
    ///
    /// Delivery is retried with backoff while connected, and replayed after
    /// every reconnect.
    pub fn register(self: &Arc<Self>, node: Node) {
        {
            let mut registrations = lock(&self.registrations);
            if !registrations.contains(&node) {
                registrations.push(node.clone());
            }
        }
        if self.state() != UplinkState::Connected {
            tracing::debug!(service = %node.service, version = %node.version, "Registration deferred until connected");
            return;
        }

        let client = Arc::clone(self);
        self.spawn(async move {
            let mut attempt = 1;
            while client.state() == UplinkState::Connected {
                match client.uplink.register(&node).await {
                    Ok(()) => {
                        tracing::debug!(service = %node.service, version = %node.version, address = %node.address, "Registered service");
                        return;
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!(service = %node.service, error = %e, "Registration rejected");
                        return;
                    }
                    // Replayed once the reconnect loop is back up.
                    Err(UplinkError::NotConnected) => {
                        tracing::debug!(service = %node.service, "Registration hit a dropped connection");
                        client.connection_lost();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(service = %node.service, attempt, error = %e, "Registration failed, retrying");
                        tokio::time::sleep(client.options.backoff_for(attempt)).await;
                        attempt += 1;
                    }
                }
            }
        });
    }

    /// Spawn `task` on the runtime the client was started on.
    ///
    /// Keeps subscription pumps and waiters running even when the caller is
    /// driving a short-lived runtime of its own, as blocking callers do.
    ///
    /// # Panics
    /// Panics if the client was never started and no runtime is current.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.runtime.get() {
            Some(handle) => handle.spawn(task),
            None => tokio::spawn(task),
        }
    }

    /// Subscribe to a key on the live connection.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the client is `Connected`.
    pub async fn subscribe(self: &Arc<Self>, key: &ServiceKey) -> Result<Subscription, UplinkError> {
        if self.state() != UplinkState::Connected {
            return Err(UplinkError::NotConnected);
        }
        let result = self.uplink.subscribe(key).await;
        if let Err(UplinkError::NotConnected) = result {
            self.connection_lost();
        }
        result
    }

    /// Note that the connection dropped and begin reconnecting.
    ///
    /// Only the first report per connection starts a reconnect loop.
    pub fn connection_lost(self: &Arc<Self>) {
        let lost = self.state.send_if_modified(|state| {
            if *state == UplinkState::Connected {
                *state = UplinkState::Disconnected;
                true
            } else {
                false
            }
        });
        if !lost {
            return;
        }

        tracing::warn!("Uplink connection lost, reconnecting");
        let client = Arc::clone(self);
        let handle = self.spawn(async move { client.reconnect_loop().await });
        if let Some(previous) = lock(&self.reconnect).replace(handle) {
            previous.abort();
        }
    }

    /// Stop the client and close the connection. Terminal.
    pub async fn stop(&self) {
        self.state.send_replace(UplinkState::Stopped);
        if let Some(handle) = lock(&self.reconnect).take() {
            handle.abort();
        }
        if let Err(e) = self.uplink.disconnect().await {
            tracing::warn!(error = %e, "Uplink disconnect failed");
        }
        tracing::info!("Uplink stopped");
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 1;
        loop {
            if !self.transition(UplinkState::Connecting) {
                return;
            }
            match self.connect_once().await {
                Ok(()) => {
                    if self.transition(UplinkState::Connected) {
                        tracing::info!(attempt, "Uplink reconnected");
                        self.replay_registrations().await;
                    }
                    return;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(attempt, error = %e, "Uplink reconnect failed fatally");
                    self.transition(UplinkState::Disconnected);
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Uplink reconnect failed");
                    if !self.transition(UplinkState::Disconnected) {
                        return;
                    }
                }
            }
            tokio::time::sleep(self.options.backoff_for(attempt)).await;
            attempt += 1;
        }
    }

    async fn connect_once(&self) -> Result<(), UplinkError> {
        tokio::time::timeout(self.options.connect_timeout, self.uplink.connect())
            .await
            .unwrap_or_else(|_| Err(UplinkError::Transient("connect timed out".to_string())))
    }

    async fn replay_registrations(&self) {
        for node in self.registrations() {
            if let Err(e) = self.uplink.register(&node).await {
                tracing::warn!(service = %node.service, error = %e, "Registration replay failed");
            }
        }
    }

    /// Move to `to` unless stopped. Returns whether the transition happened.
    fn transition(&self, to: UplinkState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == UplinkState::Stopped {
                return false;
            }
            *state = to;
            true
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
