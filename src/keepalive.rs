//! Keep-alive prober
//!
//! Sends a ping through the engine at a fixed interval and waits for the
//! pong. Failed probes are logged and counted; the watchdog is responsible
//! for acting on a dead connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::KeepAliveConfig;
use crate::engine::DispatchEngine;
use crate::error::ClientError;
use crate::future::MessageFuture;
use crate::protocol::Request;

pub struct KeepAliveProber {
    inner: Arc<ProberInner>,
}

struct ProberInner {
    engine: Arc<DispatchEngine>,
    config: KeepAliveConfig,
    active: AtomicBool,
    trigger: Notify,
    probes: AtomicU64,
    failures: AtomicU64,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveProber {
    pub fn new(engine: Arc<DispatchEngine>, config: KeepAliveConfig) -> Self {
        Self {
            inner: Arc::new(ProberInner {
                engine,
                config,
                active: AtomicBool::new(false),
                trigger: Notify::new(),
                probes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Start probing. Starting a running prober does nothing.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(probe_loop(Arc::clone(&self.inner)));
        *self.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop probing, waking the prober if it is waiting.
    pub fn deactivate(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            self.inner.trigger.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Probes sent so far.
    pub fn probes(&self) -> u64 {
        self.inner.probes.load(Ordering::SeqCst)
    }

    /// Probes that failed, timed out or were cancelled.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAliveProber {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = task {
            handle.abort();
        }
    }
}

async fn probe_loop(inner: Arc<ProberInner>) {
    while inner.active.load(Ordering::SeqCst) {
        inner.probe().await;
        if !inner.active.load(Ordering::SeqCst) {
            break;
        }
        let _ = tokio::time::timeout(inner.config.interval, inner.trigger.notified()).await;
    }
    debug!("Keep-alive prober stopped");
}

impl ProberInner {
    async fn probe(&self) {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let sent = Instant::now();
        let future = MessageFuture::new();
        let id = self
            .engine
            .submit(Request::ping(), future.clone().into())
            .await;

        let result = tokio::select! {
            result = future.wait() => result,
            _ = self.trigger.notified() => {
                if let Some(id) = id {
                    self.engine.cancel(id);
                }
                return;
            }
        };

        match result {
            Ok(_) => debug!(rtt = ?sent.elapsed(), "Keep-alive pong received"),
            Err(ClientError::Cancelled) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!("Keep-alive ping cancelled");
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                error!(error = %e, "Keep-alive ping failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{answer_all, MockChannel};
    use crate::channel::InboundHandler;
    use crate::config::EngineConfig;
    use crate::protocol::RequestType;
    use std::time::Duration;
    use tokio::time::sleep;

    fn config() -> KeepAliveConfig {
        KeepAliveConfig {
            interval: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_at_interval() {
        let engine = Arc::new(DispatchEngine::new(EngineConfig::default()).unwrap());
        let handler: Arc<dyn InboundHandler> = engine.clone();
        let channel = MockChannel::new("mock://ping", handler, Some(Arc::new(answer_all)));
        engine.attach_channel(channel.clone()).await;

        let prober = KeepAliveProber::new(Arc::clone(&engine), config());
        prober.start();
        sleep(Duration::from_millis(250)).await;

        assert_eq!(prober.probes(), 3);
        assert_eq!(prober.failures(), 0);
        assert!(channel.sent().iter().all(|r| r.kind == RequestType::Ping));
        assert_eq!(engine.pending_count(), 0);

        prober.deactivate();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(prober.probes(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted() {
        let engine = Arc::new(DispatchEngine::new(EngineConfig::default()).unwrap());
        let prober = KeepAliveProber::new(Arc::clone(&engine), config());
        prober.start();
        sleep(Duration::from_millis(150)).await;

        // No channel attached: every probe fails immediately
        assert_eq!(prober.probes(), 2);
        assert_eq!(prober.failures(), 2);
        prober.deactivate();
        assert!(!prober.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_interrupts_pending_probe() {
        let engine = Arc::new(DispatchEngine::new(EngineConfig::default()).unwrap());
        let handler: Arc<dyn InboundHandler> = engine.clone();
        let channel = MockChannel::new("mock://silent", handler, None);
        engine.attach_channel(channel.clone()).await;

        let prober = KeepAliveProber::new(Arc::clone(&engine), config());
        prober.start();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(channel.sent_count(), 1);

        assert_eq!(engine.pending_count(), 1);

        prober.deactivate();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(prober.probes(), 1);
        assert_eq!(prober.failures(), 0);
        assert_eq!(engine.pending_count(), 0);
    }
}
