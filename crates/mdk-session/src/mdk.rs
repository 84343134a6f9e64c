//! The MDK root: uplink lifecycle, registration and session factory.

use std::{sync::Arc, time::Duration};

use mdk_core::{Context, ContextPropagator, DiscoveryUplink, Node};
use mdk_discovery::{NodeSelector, ResolutionEngine, UplinkClient, UplinkState};

use crate::{MdkConfig, MdkError, Session};

/// Process-wide MDK instance.
///
/// Construct one explicitly, share it as `Arc<Mdk>`, and create a `Session`
/// per unit of work. Safe for concurrent use by many sessions.
pub struct Mdk {
    config: MdkConfig,
    client: Arc<UplinkClient>,
    engine: ResolutionEngine,
}

impl Mdk {
    /// Create an MDK over `uplink`. The uplink is not connected until `start`.
    #[must_use]
    pub fn new(config: MdkConfig, uplink: Arc<dyn DiscoveryUplink>) -> Arc<Self> {
        let client = UplinkClient::new(uplink, config.client_options());
        let engine = ResolutionEngine::new(
            Arc::clone(&client),
            NodeSelector::new(config.selection_seed),
        );
        Arc::new(Self {
            config,
            client,
            engine,
        })
    }

    /// Connect the uplink. Returns once connected or failed.
    ///
    /// Calling `start` on a running MDK is a no-op.
    ///
    /// # Errors
    /// Returns `MdkStopped` after `stop`, or the uplink error that made the
    /// connection attempts give up.
    pub async fn start(&self) -> Result<(), MdkError> {
        self.ensure_running()?;
        self.client.start().await.map_err(|e| {
            if self.client.state() == UplinkState::Stopped {
                MdkError::MdkStopped
            } else {
                MdkError::Uplink(e)
            }
        })?;
        tracing::info!("MDK started");
        Ok(())
    }

    /// Fail all pending resolutions with `UplinkDisconnected` and release
    /// the connection. Terminal.
    pub async fn stop(&self) {
        if self.client.state() == UplinkState::Stopped {
            return;
        }
        let drained = self.engine.shutdown();
        self.client.stop().await;
        tracing::info!(drained, "MDK stopped");
    }

    /// Make a local service known to discovery.
    ///
    /// Fire-and-forget: delivery happens in the background and is retried
    /// across reconnects.
    ///
    /// # Errors
    /// Returns `MdkStopped` after `stop`.
    pub fn register(
        &self,
        service: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<(), MdkError> {
        self.ensure_running()?;
        let node = Node::new(service, version, address);
        tracing::debug!(service = %node.service, version = %node.version, address = %node.address, "Registering service");
        self.client.register(node);
        Ok(())
    }

    /// Create a session starting a new trace.
    #[must_use]
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self), Context::new())
    }

    /// Create a session continuing the trace encoded in `token`.
    ///
    /// # Errors
    /// Returns `InvalidContextToken` if the token is corrupt; callers that
    /// want an untraced fallback should use `session()` on error.
    pub fn join(self: &Arc<Self>, token: &str) -> Result<Session, MdkError> {
        let propagated = ContextPropagator::decode(token).inspect_err(|e| {
            tracing::warn!(error = %e, "Rejected context token");
        })?;
        Ok(Session::new(
            Arc::clone(self),
            Context::continuing(propagated),
        ))
    }

    /// Connection state of the uplink.
    #[must_use]
    pub fn state(&self) -> UplinkState {
        self.client.state()
    }

    #[must_use]
    pub const fn config(&self) -> &MdkConfig {
        &self.config
    }

    /// Timeout applied by `Session::resolve_default`.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Services registered by this process.
    #[must_use]
    pub fn registrations(&self) -> Vec<Node> {
        self.client.registrations()
    }

    pub(crate) const fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    fn ensure_running(&self) -> Result<(), MdkError> {
        if self.client.state() == UplinkState::Stopped {
            return Err(MdkError::MdkStopped);
        }
        Ok(())
    }
}
