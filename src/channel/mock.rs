//! In-memory transport for testing.
//!
//! Channels record every request they are asked to send and can answer them
//! through a configurable responder. Tests drive the inbound side directly
//! with `MockChannel::deliver` and simulate connection loss with
//! `MockChannel::drop_connection`.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{next_channel_id, Channel, ChannelId, InboundHandler, Transport};
use crate::error::{ClientError, Result};
use crate::protocol::{Request, RequestType};

/// Computes the server's answer to a sent request, if any.
pub type Responder = Arc<dyn Fn(&Request) -> Option<Request> + Send + Sync>;

/// Answer every request the way a healthy server would.
///
/// Pings get a pong, queries and calls an empty list result, everything else
/// that expects an answer a success.
pub fn answer_all(request: &Request) -> Option<Request> {
    let kind = match request.kind {
        RequestType::Ping => RequestType::Pong,
        RequestType::Query | RequestType::ProcedureCall | RequestType::DirectExecute => {
            return Some(
                Request::with_id(request.id, RequestType::Result)
                    .with_payload(json!({"type": "list", "results": []})),
            )
        }
        RequestType::Message
        | RequestType::Authentication
        | RequestType::StoreProcedure
        | RequestType::DeleteProcedure => RequestType::Success,
        RequestType::Pong | RequestType::Result | RequestType::Success | RequestType::Error => {
            return None
        }
    };
    Some(Request::with_id(request.id, kind))
}

/// Mock transport handing out `MockChannel`s.
#[derive(Default)]
pub struct MockTransport {
    responder: Option<Responder>,
    failing_opens: AtomicU32,
    open_count: AtomicU32,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockTransport {
    /// Create a transport whose channels never answer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer sent requests with `responder`.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Request) -> Option<Request> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Make the next `count` opens fail.
    pub fn fail_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Number of open attempts, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Channels opened so far, oldest first.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.channels().pop()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, address: &str, handler: Arc<dyn InboundHandler>) -> Result<Arc<dyn Channel>> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ClientError::Transport(format!("connection refused: {address}")));
        }

        let channel = MockChannel::new(address, handler, self.responder.clone());
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&channel));
        let channel: Arc<dyn Channel> = channel;
        Ok(channel)
    }
}

/// Mock channel recording sent requests.
pub struct MockChannel {
    id: ChannelId,
    address: String,
    handler: Arc<dyn InboundHandler>,
    responder: Option<Responder>,
    open: AtomicBool,
    fail_sends: AtomicBool,
    close_count: AtomicUsize,
    sent: Mutex<Vec<Request>>,
}

impl MockChannel {
    pub fn new(
        address: impl Into<String>,
        handler: Arc<dyn InboundHandler>,
        responder: Option<Responder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            address: address.into(),
            handler,
            responder,
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Make sends fail without closing the channel.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Push an inbound request as if the server had sent it.
    pub fn deliver(&self, request: Request) {
        self.handler.on_request(request);
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.handler.on_closed();
        }
    }

    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn last_sent(&self) -> Option<Request> {
        self.sent().pop()
    }

    /// Number of times `close` was called on an open channel.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, request: &Request) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::SendFailed("mock send failure".into()));
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(response) = self.responder.as_ref().and_then(|r| r(request)) {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move { handler.on_request(response) });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            self.handler.on_closed();
        }
    }
}
