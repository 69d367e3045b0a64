//! WebSocket channels
//!
//! Each channel owns the send half of a tokio-tungstenite connection and a
//! reader task draining the receive half. The reader answers server pings
//! itself and forwards every other decoded request to the inbound handler.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{next_channel_id, Channel, ChannelId, InboundHandler, Transport};
use crate::error::{ClientError, Result};
use crate::protocol::{Codec, Frame, Request, RequestType};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Opens WebSocket channels using a fixed codec.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    codec: Codec,
}

impl WsTransport {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, address: &str, handler: Arc<dyn InboundHandler>) -> Result<Arc<dyn Channel>> {
        let channel: Arc<dyn Channel> = WsChannel::connect(address, self.codec, handler).await?;
        Ok(channel)
    }
}

/// A connected WebSocket channel.
pub struct WsChannel {
    id: ChannelId,
    address: String,
    codec: Codec,
    sink: Mutex<WsSink>,
    open: AtomicBool,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    /// Connect to `address` and start the reader task.
    pub async fn connect(
        address: &str,
        codec: Codec,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Arc<Self>> {
        debug!(address = %address, "Connecting to WebSocket");

        let mut request = address
            .into_client_request()
            .map_err(|e| ClientError::Transport(format!("Invalid address {address}: {e}")))?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("http://localhost"));

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket connect failed: {e}")))?;
        let (sink, stream) = ws.split();

        let channel = Arc::new(Self {
            id: next_channel_id(),
            address: address.to_string(),
            codec,
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
            reader: std::sync::Mutex::new(None),
        });

        let reader = tokio::spawn(reader_loop(
            stream,
            Arc::downgrade(&channel),
            handler,
            codec,
        ));
        *channel
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reader);

        info!(address = %address, channel = channel.id, "WebSocket connected");
        Ok(channel)
    }

    async fn send_frame(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            ClientError::SendFailed(e.to_string())
        })
    }
}

#[async_trait]
impl Channel for WsChannel {
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
        let message = match self.codec.encode(request)? {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.send_frame(message).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(channel = self.id, address = %self.address, "Closing WebSocket");
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(channel = self.id, error = %e, "Close handshake failed");
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        let reader = self.reader.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = reader.take() {
            handle.abort();
        }
    }
}

/// Drain the receive half until the connection ends.
async fn reader_loop(
    mut stream: WsStream,
    channel: Weak<WsChannel>,
    handler: Arc<dyn InboundHandler>,
    codec: Codec,
) {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(data)) => Frame::Binary(data),
            Ok(Message::Close(reason)) => {
                info!(reason = ?reason, "Server closed WebSocket");
                break;
            }
            // Transport-level ping/pong is answered by tungstenite
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket receive failed");
                break;
            }
        };

        let request = match codec.decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Dropping undecodable frame");
                continue;
            }
        };

        if request.kind == RequestType::Ping {
            let Some(channel) = channel.upgrade() else { break };
            let pong = Request::with_id(request.id, RequestType::Pong);
            if let Err(e) = channel.send(&pong).await {
                error!(id = request.id, error = %e, "Failed to answer ping");
            }
            continue;
        }

        handler.on_request(request);
    }

    if let Some(channel) = channel.upgrade() {
        channel.open.store(false, Ordering::SeqCst);
        debug!(channel = channel.id, "WebSocket reader finished");
    }
    handler.on_closed();
}
