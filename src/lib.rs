//! websock-client - request correlation for WebSocket query servers
//!
//! Clients send typed requests over one or more long-lived WebSocket
//! connections and get back futures that resolve when the matching response
//! arrives, fail on error or timeout, or are cancelled.
//!
//! ## Components
//!
//! - **Engine**: correlation ids, timeouts with retries, broadcast fan-in,
//!   round-robin routing and stored-procedure replay
//! - **Watchdog**: connect, authenticate and reconnect one connection
//! - **Keep-alive**: periodic ping probes
//! - **Connectors**: single- and multi-connection entry points
//!
//! ```no_run
//! use websock_client::{Connector, Credentials, Request, RequestType};
//!
//! # async fn run() -> websock_client::Result<()> {
//! let connector = Connector::new("ws://localhost:8080/websocket");
//! let engine = connector.connect(Some(Credentials::new("admin", "secret"))).await?;
//!
//! let query = Request::new(RequestType::Query).with_payload("MATCH (n) RETURN n LIMIT 10");
//! let results = engine.send_query(query).await.wait().await?;
//! println!("{} rows", results.len());
//!
//! connector.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod future;
pub mod keepalive;
pub mod protocol;
pub mod watchdog;

pub use auth::{CredentialHasher, Credentials};
pub use config::{
    Args, CodecConfig, ConnectorConfig, EngineConfig, IdStrategy, KeepAliveConfig, Routing,
    WatchdogConfig,
};
pub use connector::{Connector, MultiConnector};
pub use engine::DispatchEngine;
pub use error::{ClientError, Result};
pub use future::{Callback, MessageFuture, PendingFuture, QueryFuture};
pub use keepalive::KeepAliveProber;
pub use protocol::{Request, RequestId, RequestType, ResultSet};
pub use watchdog::{ConnectionWatchdog, WatchdogState};
