//! Connectors
//!
//! A connector is the entry point of the library. It builds a dispatch
//! engine, one watchdog per connection and, optionally, a keep-alive prober,
//! and hands the engine back to the caller for sending requests.
//!
//! - `Connector` keeps one connection to one server.
//! - `MultiConnector` keeps several connections to each of several servers
//!   and broadcasts over all of them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::auth::{CredentialHasher, Credentials};
use crate::channel::{Transport, WsTransport};
use crate::config::{ConnectorConfig, EngineConfig, IdStrategy, Routing};
use crate::engine::DispatchEngine;
use crate::error::{ClientError, Result};
use crate::keepalive::KeepAliveProber;
use crate::protocol::{Compression, Format};
use crate::watchdog::{ConnectionWatchdog, WatchdogState};

/// Everything running on behalf of one connect call.
struct Session {
    engine: Arc<DispatchEngine>,
    watchdogs: Vec<ConnectionWatchdog>,
    prober: Option<KeepAliveProber>,
}

impl Session {
    /// Connect every watchdog, then start monitoring.
    ///
    /// With `fail_fast`, the first failed connect stops everything started
    /// so far and is returned. Otherwise failures are left to the watchdogs
    /// to recover from.
    async fn establish(
        engine: Arc<DispatchEngine>,
        watchdogs: Vec<ConnectionWatchdog>,
        config: &ConnectorConfig,
    ) -> Result<Self> {
        engine.activate();
        let mut session = Self {
            engine,
            watchdogs,
            prober: None,
        };

        for watchdog in &session.watchdogs {
            if let Err(e) = watchdog.connect().await {
                if config.fail_fast {
                    error!(address = %watchdog.address(), error = %e, "Initial connect failed");
                    session.stop().await;
                    return Err(e);
                }
                warn!(address = %watchdog.address(), error = %e, "Initial connect failed, retrying in background");
            }
        }

        for watchdog in &session.watchdogs {
            watchdog.start();
        }

        if config.keep_alive_enabled {
            let prober = KeepAliveProber::new(Arc::clone(&session.engine), config.keep_alive.clone());
            prober.start();
            session.prober = Some(prober);
        }
        Ok(session)
    }

    async fn stop(&self) {
        if let Some(prober) = &self.prober {
            prober.deactivate();
        }
        for watchdog in &self.watchdogs {
            watchdog.disconnect().await;
        }
        self.engine.deactivate();
    }

    fn states(&self) -> Vec<WatchdogState> {
        self.watchdogs.iter().map(|w| w.state()).collect()
    }
}

/// Shared connect/disconnect bookkeeping of both connector kinds.
struct Lifecycle {
    config: ConnectorConfig,
    transport: Arc<dyn Transport>,
    session: Mutex<Option<Session>>,
}

impl Lifecycle {
    fn new(config: ConnectorConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(config.codec.codec()));
        Self {
            config,
            transport,
            session: Mutex::new(None),
        }
    }

    async fn connect(
        &self,
        addresses: &[String],
        credentials: Option<Credentials>,
    ) -> Result<Arc<DispatchEngine>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(&session.engine));
        }

        let credentials = credentials.map(|c| c.hashed(&CredentialHasher));
        let engine = Arc::new(DispatchEngine::new(self.config.engine.clone())?);
        let watchdogs = addresses
            .iter()
            .map(|address| {
                ConnectionWatchdog::new(
                    address.clone(),
                    Arc::clone(&engine),
                    Arc::clone(&self.transport),
                    self.config.watchdog.clone(),
                    credentials.clone(),
                )
            })
            .collect();

        let session = Session::establish(Arc::clone(&engine), watchdogs, &self.config).await?;
        info!(connections = addresses.len(), "Connected");
        *slot = Some(session);
        Ok(engine)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.stop().await;
            info!("Disconnected");
        }
    }

    async fn engine(&self) -> Option<Arc<DispatchEngine>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.engine))
    }

    async fn states(&self) -> Vec<WatchdogState> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Session::states)
            .unwrap_or_default()
    }
}

/// Connects to a single server.
pub struct Connector {
    address: String,
    lifecycle: Lifecycle,
}

impl Connector {
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_config(address, ConnectorConfig::default())
    }

    pub fn with_config(address: impl Into<String>, config: ConnectorConfig) -> Self {
        Self {
            address: address.into(),
            lifecycle: Lifecycle::new(config),
        }
    }

    /// Open channels with `transport` instead of WebSockets.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.lifecycle.transport = transport;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.lifecycle.config.fail_fast = fail_fast;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.lifecycle.config.keep_alive_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle.config.engine.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.lifecycle.config.engine.retries = retries;
        self
    }

    /// How often pending requests are checked for timeouts.
    pub fn with_timer_interval(mut self, interval: Duration) -> Self {
        self.lifecycle.config.engine.timer_interval = interval;
        self
    }

    /// Replay stored procedures on every new connection.
    pub fn with_resend_procedures(mut self, resend: bool) -> Self {
        self.lifecycle.config.engine.resend_procedures = resend;
        self
    }

    /// Set the frame format, rebuilding the default WebSocket transport.
    pub fn with_codec(mut self, format: Format, compression: Compression) -> Self {
        self.lifecycle.config.codec.format = format;
        self.lifecycle.config.codec.compression = compression;
        self.lifecycle.transport = Arc::new(WsTransport::new(self.lifecycle.config.codec.codec()));
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect and return the engine. Connecting twice returns the engine of
    /// the existing session.
    pub async fn connect(&self, credentials: Option<Credentials>) -> Result<Arc<DispatchEngine>> {
        self.lifecycle
            .connect(std::slice::from_ref(&self.address), credentials)
            .await
    }

    /// Stop the watchdog and prober and close the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
    }

    /// The engine of the current session.
    pub async fn engine(&self) -> Option<Arc<DispatchEngine>> {
        self.lifecycle.engine().await
    }

    /// Connection state, if connected.
    pub async fn state(&self) -> Option<WatchdogState> {
        self.lifecycle.states().await.first().copied()
    }
}

/// Connects to several servers with several connections each.
pub struct MultiConnector {
    addresses: Vec<String>,
    lifecycle: Lifecycle,
}

impl MultiConnector {
    pub fn new(addresses: Vec<String>, connections_per_address: usize) -> Result<Self> {
        Self::with_config(addresses, connections_per_address, ConnectorConfig::default())
    }

    /// Pool routing is always used. Sequential ids are replaced by
    /// partitioned ones.
    pub fn with_config(
        addresses: Vec<String>,
        connections_per_address: usize,
        mut config: ConnectorConfig,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(ClientError::Config("at least one address is required".into()));
        }
        if connections_per_address == 0 {
            return Err(ClientError::Config(
                "connections per address must be positive".into(),
            ));
        }

        config.engine = EngineConfig {
            routing: Routing::Pool,
            ids: match config.engine.ids {
                IdStrategy::Sequential => IdStrategy::partitioned(),
                partitioned => partitioned,
            },
            ..config.engine
        };

        let addresses = addresses
            .iter()
            .flat_map(|a| std::iter::repeat(a.clone()).take(connections_per_address))
            .collect();
        Ok(Self {
            addresses,
            lifecycle: Lifecycle::new(config),
        })
    }

    /// Open channels with `transport` instead of WebSockets.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.lifecycle.transport = transport;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.lifecycle.config.fail_fast = fail_fast;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.lifecycle.config.keep_alive_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle.config.engine.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.lifecycle.config.engine.retries = retries;
        self
    }

    /// Total number of connections, across all addresses.
    pub fn connection_count(&self) -> usize {
        self.addresses.len()
    }

    pub async fn connect(&self, credentials: Option<Credentials>) -> Result<Arc<DispatchEngine>> {
        self.lifecycle.connect(&self.addresses, credentials).await
    }

    pub async fn disconnect(&self) {
        self.lifecycle.disconnect().await;
    }

    pub async fn engine(&self) -> Option<Arc<DispatchEngine>> {
        self.lifecycle.engine().await
    }

    /// Connection states, one per connection.
    pub async fn states(&self) -> Vec<WatchdogState> {
        self.lifecycle.states().await
    }
}
