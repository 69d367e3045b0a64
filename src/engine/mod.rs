//! Request dispatch engine
//!
//! The engine assigns correlation ids, sends requests over the attached
//! channels, correlates responses back to the futures handed to callers,
//! and runs a periodic sweep that retries or fails requests whose response
//! is overdue.
//!
//! Routing is fixed at construction:
//! - `Routing::Single` sends on the one attached channel.
//! - `Routing::Pool` broadcasts by default and only completes a request once
//!   every member answered. Procedure calls and direct executes go to a
//!   single member chosen round-robin.

mod ids;
mod pool;
mod procedures;
mod sweep;
mod table;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::channel::{Channel, ChannelId, InboundHandler};
use crate::config::{EngineConfig, Routing};
use crate::error::{ClientError, Result};
use crate::future::{Callback, MessageFuture, QueryFuture};
use crate::protocol::{Request, RequestId};

use ids::IdAllocator;
use pool::ChannelPool;
use procedures::ProcedureRegistry;
use table::{FanIn, PendingEntry, RequestTable};

/// Settings that can change while the engine runs.
struct Settings {
    timeout_ms: AtomicU64,
    timer_ms: AtomicU64,
    retries: AtomicU32,
    resend_procedures: AtomicBool,
}

impl Settings {
    fn new(config: &EngineConfig) -> Self {
        Self {
            timeout_ms: AtomicU64::new(config.timeout.as_millis() as u64),
            timer_ms: AtomicU64::new(config.timer_interval.as_millis().max(1) as u64),
            retries: AtomicU32::new(config.retries),
            resend_procedures: AtomicBool::new(config.resend_procedures),
        }
    }
}

/// Correlates requests with responses over one or more channels.
pub struct DispatchEngine {
    routing: Routing,
    ids: IdAllocator,
    table: RequestTable,
    procedures: ProcedureRegistry,
    channels: ChannelPool,
    settings: Settings,
    trigger: Notify,
    active: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            routing: config.routing,
            ids: IdAllocator::new(config.ids),
            table: RequestTable::default(),
            procedures: ProcedureRegistry::default(),
            channels: ChannelPool::new(config.routing),
            settings: Settings::new(&config),
            trigger: Notify::new(),
            active: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// Start the timeout sweep. Starting an active engine does nothing.
    pub fn activate(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(sweep::sweep_loop(Arc::downgrade(self)));
        if let Some(old) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            old.abort();
        }
        debug!(routing = ?self.routing, "Dispatch engine activated");
    }

    /// Stop the timeout sweep. Pending requests stay pending.
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.trigger.notify_one();
        debug!("Dispatch engine deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Allocate a fresh correlation id.
    pub fn next_id(&self) -> RequestId {
        self.ids.next()
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Send a message and return a future for its raw response.
    pub async fn send_message(&self, request: Request) -> MessageFuture {
        let future = MessageFuture::new();
        self.submit(request, future.clone().into()).await;
        future
    }

    /// Send a message, completing the caller's future.
    pub async fn send_message_with(&self, request: Request, future: MessageFuture) {
        self.submit(request, future.into()).await;
    }

    /// Send a query and return a future for its decoded result set.
    pub async fn send_query(&self, request: Request) -> QueryFuture {
        let future = QueryFuture::new();
        self.submit(request, future.clone().into()).await;
        future
    }

    /// Send a query, completing the caller's future.
    pub async fn send_query_with(&self, request: Request, future: QueryFuture) {
        self.submit(request, future.into()).await;
    }

    /// Send `request` through the engine's routing.
    ///
    /// Returns the id the request is pending under, for `cancel`. Failures
    /// are reported through `callback` and return `None`: no channel
    /// attached fails it with `NoConnection` before an id is assigned, a
    /// transport error fails it with `SendFailed`.
    pub async fn submit(&self, mut request: Request, callback: Callback) -> Option<RequestId> {
        let members = self.channels.snapshot();
        if members.is_empty() {
            debug!(kind = %request.kind, "No channel attached");
            callback.fail(ClientError::NoConnection);
            return None;
        }

        let id = self.ids.next();
        request.id = id;
        self.table.insert(
            id,
            PendingEntry {
                request: request.clone(),
                callback: callback.clone(),
                pinned: None,
            },
        );
        trace!(id, kind = %request.kind, "Submitting request");

        match self.dispatch(&request, &members).await {
            Ok(()) => {
                if request.kind.is_procedure_change() {
                    self.procedures.record(&request);
                }
                Some(id)
            }
            Err(e) => {
                error!(id, kind = %request.kind, error = %e, "Failed to send request");
                callback.fail(ClientError::SendFailed(e.to_string()));
                self.table.remove(id);
                None
            }
        }
    }

    /// Send `request` on one specific channel, bypassing routing.
    ///
    /// Used before a channel is attached, for authentication. Retries go to
    /// the same channel.
    pub async fn send_direct_message(
        &self,
        request: Request,
        channel: Arc<dyn Channel>,
    ) -> MessageFuture {
        let future = MessageFuture::new();
        self.submit_direct(request, future.clone().into(), channel).await;
        future
    }

    /// Like `submit`, but bound to `channel` instead of the routing.
    pub async fn submit_direct(
        &self,
        mut request: Request,
        callback: Callback,
        channel: Arc<dyn Channel>,
    ) -> Option<RequestId> {
        if !channel.is_open() {
            callback.fail(ClientError::NoConnection);
            return None;
        }

        let id = self.ids.next();
        request.id = id;
        self.table.insert(
            id,
            PendingEntry {
                request: request.clone(),
                callback: callback.clone(),
                pinned: Some(Arc::clone(&channel)),
            },
        );

        match channel.send(&request).await {
            Ok(()) => Some(id),
            Err(e) => {
                error!(id, kind = %request.kind, channel = channel.id(), error = %e, "Failed to send direct message");
                callback.fail(ClientError::SendFailed(e.to_string()));
                self.table.remove(id);
                None
            }
        }
    }

    /// Send on the members chosen by the routing strategy.
    async fn dispatch(&self, request: &Request, members: &[Arc<dyn Channel>]) -> Result<()> {
        match self.routing {
            Routing::Single => match members.first() {
                Some(channel) => channel.send(request).await,
                None => Err(ClientError::NoConnection),
            },
            Routing::Pool if request.kind.is_targeted() => match self.channels.pick(members) {
                Some(channel) => channel.send(request).await,
                None => Err(ClientError::NoConnection),
            },
            Routing::Pool => {
                self.table.expect_responses(request.id, members.len());
                for channel in members {
                    channel.send(request).await?;
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Responses
    // =========================================================================

    /// Correlate an inbound response with its pending request.
    ///
    /// Returns whether the response was consumed. Unconsumed responses are
    /// queued and retried once on the next sweep, in case they overtook the
    /// registration of their request.
    pub fn handle_response(&self, response: Request) -> bool {
        let handled = self.correlate(&response);
        if !handled {
            trace!(id = response.id, kind = %response.kind, "Queueing unmatched response");
            self.table.queue_unhandled(response);
        }
        handled
    }

    fn correlate(&self, response: &Request) -> bool {
        let id = response.id;
        let broadcast = match self.table.count_down(id) {
            FanIn::Waiting(left) => {
                trace!(id, left, "Waiting for more broadcast responses");
                return true;
            }
            FanIn::Complete => true,
            FanIn::Untracked => false,
        };

        match self.table.callback(id) {
            Some(callback) => {
                callback.complete(response.clone());
                self.table.remove(id);
                true
            }
            None => broadcast,
        }
    }

    /// Cancel the request `id`, waking its waiters.
    pub fn cancel(&self, id: RequestId) {
        if let Some(entry) = self.table.remove(id) {
            debug!(id, "Cancelling request");
            entry.callback.cancel();
        }
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Attach a channel and replay registered procedures onto it.
    ///
    /// The engine keeps a weak reference; the caller owns the channel.
    pub async fn attach_channel(&self, channel: Arc<dyn Channel>) {
        self.channels.attach(Arc::clone(&channel));
        info!(channel = channel.id(), address = %channel.address(), "Channel attached");

        if self.resend_procedures() {
            self.replay_procedures(&channel).await;
        }
    }

    pub fn detach_channel(&self, id: ChannelId) -> bool {
        let detached = self.channels.detach(id);
        if detached {
            info!(channel = id, "Channel detached");
        }
        detached
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    async fn replay_procedures(&self, channel: &Arc<dyn Channel>) {
        for (name, stored) in self.procedures.snapshot() {
            let future = self.send_direct_message(stored.replay(), Arc::clone(channel)).await;
            match future.error() {
                Some(e) => error!(procedure = %name, error = %e, "Failed to replay procedure"),
                None => debug!(procedure = %name, channel = channel.id(), "Replayed procedure"),
            }
        }
    }

    /// Names of the procedures that will be replayed on attach.
    pub fn registered_procedures(&self) -> Vec<String> {
        self.procedures.names()
    }

    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    /// Responses waiting for their retry on the next sweep.
    pub fn unhandled_count(&self) -> usize {
        self.table.unhandled_len()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout_ms.load(Ordering::SeqCst))
    }

    /// Set the response timeout. Zero disables timeouts.
    pub fn set_timeout(&self, timeout: Duration) {
        self.settings
            .timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.settings.timer_ms.load(Ordering::SeqCst))
    }

    /// Set the sweep interval. Intervals under a millisecond are ignored.
    pub fn set_timer_interval(&self, interval: Duration) {
        let millis = interval.as_millis() as u64;
        if millis == 0 {
            debug!("Ignoring non-positive timer interval");
            return;
        }
        self.settings.timer_ms.store(millis, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    pub fn retry_count(&self) -> u32 {
        self.settings.retries.load(Ordering::SeqCst)
    }

    pub fn set_retry_count(&self, retries: u32) {
        self.settings.retries.store(retries, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    pub fn resend_procedures(&self) -> bool {
        self.settings.resend_procedures.load(Ordering::SeqCst)
    }

    pub fn set_resend_procedures(&self, resend: bool) {
        self.settings
            .resend_procedures
            .store(resend, Ordering::SeqCst);
    }
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("routing", &self.routing)
            .field("active", &self.is_active())
            .field("channels", &self.channel_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl InboundHandler for DispatchEngine {
    fn on_request(&self, request: Request) {
        self.handle_response(request);
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        let sweeper = self.sweeper.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}
