//! Channels and transports
//!
//! A `Channel` is one live connection to a server. A `Transport` opens
//! channels and wires their inbound traffic into an `InboundHandler`. The
//! dispatch engine only ever sees these traits, so the WebSocket transport
//! and the in-memory mock are interchangeable.

pub mod mock;
mod ws;

pub use ws::{WsChannel, WsTransport};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::Request;

/// Process-unique channel identifier.
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a channel id for a new channel.
pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// A live, bidirectional connection to a server.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Address the channel is connected to.
    fn address(&self) -> &str;

    /// Send one request. Errors mean nothing was sent.
    async fn send(&self, request: &Request) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the channel. Closing a closed channel does nothing.
    async fn close(&self);
}

/// Receiver of decoded inbound traffic.
pub trait InboundHandler: Send + Sync {
    fn on_request(&self, request: Request);

    /// The channel closed, from either side.
    fn on_closed(&self) {}
}

/// Factory for channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, address: &str, handler: Arc<dyn InboundHandler>) -> Result<Arc<dyn Channel>>;
}
