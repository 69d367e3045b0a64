//! Configuration for websock-client
//!
//! Library configuration is plain structs with defaults. The binary's CLI
//! arguments and environment variables are handled with clap and mapped onto
//! those structs.

use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::protocol::{Codec, Compression, Format};

/// Default response timeout before a request is retried or failed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300_000);
/// Default interval between timeout sweeps.
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_millis(1_000);
/// Default number of resends after the first attempt timed out.
pub const DEFAULT_RETRIES: u32 = 2;

/// Number of independent id ranges of a pool-routed engine.
pub const ID_RANGES: u32 = 40;
/// Size of each id range.
pub const ID_RANGE_SIZE: u32 = 100_000;

/// How an engine routes requests onto its channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    /// Exactly one channel at a time; attaching replaces it.
    #[default]
    Single,
    /// A pool of channels. Targeted request types go to one member chosen
    /// round-robin, everything else is broadcast to all members.
    Pool,
}

/// How an engine allocates correlation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// One counter behind one lock.
    #[default]
    Sequential,
    /// Independent ranges, each behind its own lock and wrapping within
    /// itself.
    Partitioned { ranges: u32, range_size: u32 },
}

impl IdStrategy {
    pub fn partitioned() -> Self {
        IdStrategy::Partitioned {
            ranges: ID_RANGES,
            range_size: ID_RANGE_SIZE,
        }
    }
}

/// Configuration for a dispatch engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Response timeout. Zero disables timeout enforcement.
    pub timeout: Duration,
    /// Interval between timeout sweeps.
    pub timer_interval: Duration,
    /// Resends after the first attempt timed out.
    pub retries: u32,
    /// Replay registered procedures onto newly attached channels.
    pub resend_procedures: bool,
    pub routing: Routing,
    pub ids: IdStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            timer_interval: DEFAULT_TIMER_INTERVAL,
            retries: DEFAULT_RETRIES,
            resend_procedures: true,
            routing: Routing::Single,
            ids: IdStrategy::Sequential,
        }
    }
}

impl EngineConfig {
    /// Defaults for a multi-connection engine.
    pub fn pool() -> Self {
        Self {
            routing: Routing::Pool,
            ids: IdStrategy::partitioned(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timer_interval.is_zero() {
            return Err(ClientError::Config("timer interval must be positive".into()));
        }
        if let IdStrategy::Partitioned { ranges, range_size } = self.ids {
            if ranges == 0 || range_size == 0 {
                return Err(ClientError::Config(
                    "id ranges and range size must be positive".into(),
                ));
            }
            if ranges.checked_mul(range_size).is_none() {
                return Err(ClientError::Config(format!(
                    "{ranges} id ranges of {range_size} ids exceed the id space"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for a connection watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Interval between connection checks.
    pub check_interval: Duration,
    /// Pause between failed reconnection attempts.
    pub reconnect_interval: Duration,
    /// Time allowed for the authentication handshake.
    pub auth_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(1_000),
            reconnect_interval: Duration::from_millis(5_000),
            auth_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the keep-alive prober.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10_000),
        }
    }
}

/// Frame format and compression used by WebSocket channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecConfig {
    pub format: Format,
    pub compression: Compression,
}

impl CodecConfig {
    pub fn codec(&self) -> Codec {
        Codec::new(self.format, self.compression)
    }
}

/// Configuration for single- and multi-connection connectors.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub engine: EngineConfig,
    pub watchdog: WatchdogConfig,
    pub keep_alive: KeepAliveConfig,
    pub codec: CodecConfig,
    /// Propagate the first failure of the initial connect instead of
    /// retrying in the background.
    pub fail_fast: bool,
    /// Run a keep-alive prober while connected.
    pub keep_alive_enabled: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            watchdog: WatchdogConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            codec: CodecConfig::default(),
            fail_fast: false,
            keep_alive_enabled: true,
        }
    }
}

/// websock-client - query server WebSocket client
#[derive(Parser, Debug, Clone)]
#[command(name = "websock-client")]
#[command(about = "Client tooling for WebSocket query servers")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Hash a user/password combination for server authentication
    Hash {
        /// User name
        #[arg(short, long)]
        user: String,

        /// Clear text password (read from stdin if omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Connect to a server and measure ping round trips
    Ping(PingArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct PingArgs {
    /// Server WebSocket URL
    #[arg(long, env = "WEBSOCK_URI", default_value = "ws://localhost:8080/websocket")]
    pub uri: String,

    /// Number of pings to send
    #[arg(long, default_value = "5")]
    pub count: u32,

    /// Milliseconds between pings
    #[arg(long, default_value = "1000")]
    pub interval_ms: u64,

    /// Request timeout in milliseconds
    #[arg(long, env = "WEBSOCK_TIMEOUT_MS", default_value = "10000")]
    pub timeout_ms: u64,

    /// Frame format
    #[arg(long, env = "WEBSOCK_FORMAT", value_enum, default_value = "json")]
    pub format: Format,

    /// Compression for binary frames
    #[arg(long, env = "WEBSOCK_COMPRESSION", value_enum, default_value = "none")]
    pub compression: Compression,

    /// User name for authentication
    #[arg(long, env = "WEBSOCK_USER")]
    pub user: Option<String>,

    /// Password for authentication
    #[arg(long, env = "WEBSOCK_PASSWORD")]
    pub password: Option<String>,

    /// The password is already hashed
    #[arg(long, default_value = "false")]
    pub hashed: bool,
}

impl PingArgs {
    /// Connector configuration for a short-lived, fail-fast session.
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            engine: EngineConfig {
                timeout: Duration::from_millis(self.timeout_ms),
                retries: 0,
                ..EngineConfig::default()
            },
            codec: CodecConfig {
                format: self.format,
                compression: self.compression,
            },
            fail_fast: true,
            keep_alive_enabled: false,
            ..ConnectorConfig::default()
        }
    }
}
