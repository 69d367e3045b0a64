//! Connection watchdog
//!
//! Owns one logical connection to one address. `connect` opens a channel,
//! authenticates on it when credentials are configured and attaches it to
//! the engine. Once started, a monitor task watches the connection and
//! re-establishes it whenever it is lost, pausing between failed attempts.
//!
//! Every connect bumps a generation number. Close notifications carry the
//! generation of the channel they came from, so a stale channel closing
//! late never tears down its successor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::Credentials;
use crate::channel::{Channel, InboundHandler, Transport};
use crate::config::WatchdogConfig;
use crate::engine::DispatchEngine;
use crate::error::{ClientError, Result};
use crate::future::MessageFuture;
use crate::protocol::Request;

/// Lifecycle of a watched connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Lost,
    Stopped,
}

/// Monitor task phases.
enum Phase {
    Monitor,
    Reconnect { attempt: u32 },
}

/// Keeps one connection alive.
pub struct ConnectionWatchdog {
    inner: Arc<WatchdogInner>,
}

struct WatchdogInner {
    address: String,
    engine: Arc<DispatchEngine>,
    transport: Arc<dyn Transport>,
    credentials: Option<Credentials>,
    config: WatchdogConfig,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    generation: AtomicU64,
    disconnected: AtomicBool,
    active: AtomicBool,
    trigger: Notify,
    state: watch::Sender<WatchdogState>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionWatchdog {
    pub fn new(
        address: impl Into<String>,
        engine: Arc<DispatchEngine>,
        transport: Arc<dyn Transport>,
        config: WatchdogConfig,
        credentials: Option<Credentials>,
    ) -> Self {
        let (state, _) = watch::channel(WatchdogState::Idle);
        Self {
            inner: Arc::new(WatchdogInner {
                address: address.into(),
                engine,
                transport,
                credentials,
                config,
                channel: Mutex::new(None),
                generation: AtomicU64::new(0),
                disconnected: AtomicBool::new(false),
                active: AtomicBool::new(false),
                trigger: Notify::new(),
                state,
                monitor: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> WatchdogState {
        *self.inner.state.borrow()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<WatchdogState> {
        self.inner.state.subscribe()
    }

    /// The current channel, if connected.
    pub async fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner.channel.lock().await.clone()
    }

    /// Replace the current channel with a freshly opened one.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Start monitoring. Starting a running watchdog does nothing.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(monitor_loop(Arc::clone(&self.inner)));
        *self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        debug!(address = %self.inner.address, "Watchdog started");
    }

    /// Signal that the connection was lost.
    pub fn disconnected(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);
        self.inner.trigger.notify_one();
    }

    /// Stop monitoring and close the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.trigger.notify_one();

        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = monitor {
            handle.abort();
            let _ = handle.await;
        }

        let mut slot = self.inner.channel.lock().await;
        if slot.is_some() {
            info!(address = %self.inner.address, "Disconnecting");
        }
        self.inner.teardown(&mut slot).await;
        self.inner.state.send_replace(WatchdogState::Stopped);
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);
        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = monitor {
            handle.abort();
        }
    }
}

impl WatchdogInner {
    async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.channel.lock().await;
        self.teardown(&mut slot).await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.disconnected.store(false, Ordering::SeqCst);
        self.state.send_replace(WatchdogState::Connecting);
        info!(address = %self.address, generation, "Connecting");

        let handler = Arc::new(ChannelEvents {
            engine: Arc::clone(&self.engine),
            watchdog: Arc::downgrade(self),
            generation,
        });
        let channel = match self.transport.open(&self.address, handler).await {
            Ok(channel) => channel,
            Err(e) => {
                self.state.send_replace(WatchdogState::Lost);
                return Err(e);
            }
        };

        if let Some(credentials) = &self.credentials {
            self.state.send_replace(WatchdogState::Authenticating);
            if let Err(e) = self.authenticate(&channel, credentials).await {
                error!(address = %self.address, user = credentials.user(), error = %e, "Authentication failed");
                channel.close().await;
                self.state.send_replace(WatchdogState::Lost);
                return Err(e);
            }
            debug!(address = %self.address, user = credentials.user(), "Authenticated");
        }

        *slot = Some(Arc::clone(&channel));
        self.engine.attach_channel(channel).await;
        self.state.send_replace(WatchdogState::Connected);
        info!(address = %self.address, generation, "Connected");
        Ok(())
    }

    async fn authenticate(&self, channel: &Arc<dyn Channel>, credentials: &Credentials) -> Result<()> {
        let future = MessageFuture::new();
        let id = self
            .engine
            .submit_direct(
                credentials.authentication_request(),
                future.clone().into(),
                Arc::clone(channel),
            )
            .await;

        match future.wait_timeout(self.config.auth_timeout).await {
            Ok(_) => Ok(()),
            Err(ClientError::Remote(message)) => Err(ClientError::Authentication(
                message.unwrap_or_else(|| "rejected by server".to_string()),
            )),
            Err(e) => {
                match id {
                    Some(id) => self.engine.cancel(id),
                    None => {
                        future.cancel();
                    }
                }
                Err(ClientError::Authentication(e.to_string()))
            }
        }
    }

    /// Detach and close the current channel, if any.
    async fn teardown(&self, slot: &mut Option<Arc<dyn Channel>>) {
        if let Some(channel) = slot.take() {
            self.engine.detach_channel(channel.id());
            channel.close().await;
        }
    }

    async fn connection_lost(&self) -> bool {
        if self.disconnected.swap(false, Ordering::SeqCst) {
            return true;
        }
        match self.channel.lock().await.as_ref() {
            Some(channel) => !channel.is_open(),
            None => true,
        }
    }

    fn closed(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "Ignoring close of a replaced channel");
            return;
        }
        self.disconnected.store(true, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    async fn pause(&self, duration: Duration) {
        let _ = tokio::time::timeout(duration, self.trigger.notified()).await;
    }
}

async fn monitor_loop(inner: Arc<WatchdogInner>) {
    let mut phase = Phase::Monitor;

    while inner.active.load(Ordering::SeqCst) {
        phase = match phase {
            Phase::Monitor => {
                if inner.connection_lost().await {
                    warn!(address = %inner.address, "Connection lost, reconnecting");
                    inner.state.send_replace(WatchdogState::Lost);
                    let mut slot = inner.channel.lock().await;
                    inner.teardown(&mut slot).await;
                    Phase::Reconnect { attempt: 1 }
                } else {
                    inner.pause(inner.config.check_interval).await;
                    Phase::Monitor
                }
            }
            Phase::Reconnect { attempt } => match inner.connect().await {
                Ok(()) => {
                    info!(address = %inner.address, attempt, "Reconnected");
                    Phase::Monitor
                }
                Err(e) => {
                    warn!(
                        address = %inner.address,
                        attempt,
                        error = %e,
                        "Reconnect failed, retrying in {:?}",
                        inner.config.reconnect_interval
                    );
                    tokio::time::sleep(inner.config.reconnect_interval).await;
                    Phase::Reconnect {
                        attempt: attempt + 1,
                    }
                }
            },
        };
    }
    debug!(address = %inner.address, "Watchdog stopped");
}

/// Routes inbound traffic of one channel generation.
struct ChannelEvents {
    engine: Arc<DispatchEngine>,
    watchdog: Weak<WatchdogInner>,
    generation: u64,
}

impl InboundHandler for ChannelEvents {
    fn on_request(&self, request: Request) {
        self.engine.handle_response(request);
    }

    fn on_closed(&self) {
        if let Some(watchdog) = self.watchdog.upgrade() {
            watchdog.closed(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{answer_all, MockTransport};
    use crate::config::EngineConfig;
    use crate::protocol::{RequestType, PASSWORD};
    use tokio::time::sleep;

    fn engine() -> Arc<DispatchEngine> {
        Arc::new(DispatchEngine::new(EngineConfig::default()).unwrap())
    }

    fn quick() -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_millis(100),
            reconnect_interval: Duration::from_millis(500),
            auth_timeout: Duration::from_millis(200),
        }
    }

    fn watchdog(
        engine: &Arc<DispatchEngine>,
        transport: &Arc<MockTransport>,
        credentials: Option<Credentials>,
    ) -> ConnectionWatchdog {
        ConnectionWatchdog::new(
            "mock://server",
            Arc::clone(engine),
            transport.clone(),
            quick(),
            credentials,
        )
    }

    #[tokio::test]
    async fn test_connect_attaches_channel() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, None);

        watchdog.connect().await.unwrap();
        assert_eq!(watchdog.state(), WatchdogState::Connected);
        assert_eq!(engine.channel_count(), 1);
        assert!(watchdog.channel().await.is_some());
    }

    #[tokio::test]
    async fn test_authentication_success() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new().with_responder(answer_all));
        let watchdog = watchdog(&engine, &transport, Some(Credentials::new("admin", "secret")));

        watchdog.connect().await.unwrap();
        let channel = transport.last_channel().unwrap();
        let auth = &channel.sent()[0];
        assert_eq!(auth.kind, RequestType::Authentication);
        assert_eq!(auth.parameter(PASSWORD).and_then(|p| p.as_str()).map(str::len), Some(128));
        assert_eq!(engine.channel_count(), 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_authentication_rejected() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new().with_responder(|request: &Request| {
            (request.kind == RequestType::Authentication).then(|| {
                Request::with_id(request.id, RequestType::Error).with_payload("bad credentials")
            })
        }));
        let watchdog = watchdog(&engine, &transport, Some(Credentials::prehashed("admin", "nope")));

        let err = watchdog.connect().await.unwrap_err();
        assert_eq!(err, ClientError::Authentication("bad credentials".into()));
        assert_eq!(watchdog.state(), WatchdogState::Lost);
        assert_eq!(engine.channel_count(), 0);
        assert!(!transport.last_channel().unwrap().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_times_out() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, Some(Credentials::new("admin", "secret")));

        let err = watchdog.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
        assert_eq!(engine.channel_count(), 0);
        // The handshake leaves nothing behind for the sweep to resend
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_loss() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, None);
        watchdog.connect().await.unwrap();
        watchdog.start();

        let first = transport.last_channel().unwrap();
        first.drop_connection();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.open_count(), 2);
        let second = transport.last_channel().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(engine.channel_count(), 1);
        assert_eq!(watchdog.state(), WatchdogState::Connected);

        watchdog.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_disconnect_forces_reconnect() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, None);
        watchdog.connect().await.unwrap();
        watchdog.start();

        let first = transport.last_channel().unwrap();
        watchdog.disconnected();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.open_count(), 2);
        assert!(!first.is_open());
        assert_eq!(engine.channel_count(), 1);
        assert_eq!(watchdog.state(), WatchdogState::Connected);

        watchdog.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_after_interval() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, None);
        watchdog.connect().await.unwrap();
        watchdog.start();

        transport.fail_opens(2);
        transport.last_channel().unwrap().drop_connection();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(engine.channel_count(), 0);
        assert_eq!(watchdog.state(), WatchdogState::Lost);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.open_count(), 3);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.open_count(), 4);
        assert_eq!(watchdog.state(), WatchdogState::Connected);
        assert_eq!(engine.channel_count(), 1);

        watchdog.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_close_is_ignored() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, None);

        watchdog.connect().await.unwrap();
        watchdog.connect().await.unwrap();
        assert_eq!(transport.open_count(), 2);
        assert!(!transport.channels()[0].is_open());
        watchdog.start();

        // A late close from the first channel
        watchdog.inner.closed(1);
        sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(watchdog.state(), WatchdogState::Connected);

        watchdog.inner.closed(2);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.open_count(), 3);
        watchdog.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let engine = engine();
        let transport = Arc::new(MockTransport::new());
        let watchdog = watchdog(&engine, &transport, None);
        watchdog.connect().await.unwrap();
        watchdog.start();

        watchdog.disconnect().await;
        watchdog.disconnect().await;

        assert_eq!(watchdog.state(), WatchdogState::Stopped);
        assert_eq!(engine.channel_count(), 0);
        let channel = transport.last_channel().unwrap();
        assert!(!channel.is_open());
        assert_eq!(channel.close_count(), 1);
    }
}
