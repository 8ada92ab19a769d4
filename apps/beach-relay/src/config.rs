use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::api::ApiAuth;

const DEFAULT_PONG_WAIT_MS: u64 = 60_000;
const DEFAULT_WRITE_WAIT_MS: u64 = 10_000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;
const DEFAULT_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_INBOUND_BUFFER: usize = 100;

/// Per-connection timing and sizing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Read-inactivity timeout; any inbound frame (including pong) resets it.
    pub pong_wait: Duration,
    /// Keepalive ping interval, strictly shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline applied to every individual write.
    pub write_wait: Duration,
    /// How long a close waits for the peer before tearing down.
    pub close_timeout: Duration,
    pub max_message_size: usize,
    pub outbound_buffer: usize,
}

impl ConnectionConfig {
    /// Builds a config whose ping period is nine tenths of `pong_wait`.
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: default_ping_period(pong_wait),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_period.is_zero() {
            bail!("ping period must be greater than zero");
        }
        if self.ping_period >= self.pong_wait {
            bail!(
                "ping period ({:?}) must be shorter than the pong wait ({:?})",
                self.ping_period,
                self.pong_wait
            );
        }
        if self.write_wait.is_zero() || self.close_timeout.is_zero() {
            bail!("write wait and close timeout must be greater than zero");
        }
        if self.max_message_size == 0 || self.outbound_buffer == 0 {
            bail!("message size limit and outbound buffer must be greater than zero");
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_millis(DEFAULT_PONG_WAIT_MS);
        Self {
            pong_wait,
            ping_period: default_ping_period(pong_wait),
            write_wait: Duration::from_millis(DEFAULT_WRITE_WAIT_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

fn default_ping_period(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Depth of the hub's inbound queue drained by the routing task.
    pub inbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: DEFAULT_INBOUND_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub api_auth: ApiAuth,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay",
    author,
    version,
    about = "Beach WebRTC signaling relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Read-inactivity timeout per connection.
    #[arg(long, env = "BEACH_RELAY_PONG_WAIT_MS", default_value_t = DEFAULT_PONG_WAIT_MS)]
    pub pong_wait_ms: u64,

    /// Keepalive ping interval; defaults to 90% of the pong wait.
    #[arg(long, env = "BEACH_RELAY_PING_PERIOD_MS")]
    pub ping_period_ms: Option<u64>,

    /// Deadline for a single websocket write.
    #[arg(long, env = "BEACH_RELAY_WRITE_WAIT_MS", default_value_t = DEFAULT_WRITE_WAIT_MS)]
    pub write_wait_ms: u64,

    /// Time a closing connection waits for the peer's close acknowledgement.
    #[arg(long, env = "BEACH_RELAY_CLOSE_TIMEOUT_MS", default_value_t = DEFAULT_CLOSE_TIMEOUT_MS)]
    pub close_timeout_ms: u64,

    /// Maximum inbound message size in bytes.
    #[arg(long, env = "BEACH_RELAY_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Depth of each session's inbound routing queue.
    #[arg(long, env = "BEACH_RELAY_SESSION_QUEUE_DEPTH", default_value_t = DEFAULT_INBOUND_BUFFER)]
    pub session_queue_depth: usize,

    /// Depth of each connection's outbound queue.
    #[arg(long, env = "BEACH_RELAY_CONNECTION_QUEUE_DEPTH", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub connection_queue_depth: usize,

    /// Username for the sessions API.
    #[arg(long, env = "BEACH_RELAY_API_USERNAME", default_value = "admin")]
    pub api_username: String,

    /// Password for the sessions API (enables basic auth).
    #[arg(long, env = "BEACH_RELAY_API_PASSWORD")]
    pub api_password: Option<String>,

    /// Bearer token for the sessions API, used when no password is set.
    #[arg(long, env = "BEACH_RELAY_API_TOKEN")]
    pub api_token: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let pong_wait = Duration::from_millis(cli.pong_wait_ms);
        let mut connection = ConnectionConfig::with_pong_wait(pong_wait);
        if let Some(ping_ms) = cli.ping_period_ms {
            connection.ping_period = Duration::from_millis(ping_ms);
        }
        connection.write_wait = Duration::from_millis(cli.write_wait_ms);
        connection.close_timeout = Duration::from_millis(cli.close_timeout_ms);
        connection.max_message_size = cli.max_message_size;
        connection.outbound_buffer = cli.connection_queue_depth;
        connection
            .validate()
            .context("invalid connection settings")?;

        if cli.session_queue_depth == 0 {
            bail!("session queue depth must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr,
            connection,
            session: SessionConfig {
                inbound_buffer: cli.session_queue_depth,
            },
            api_auth: ApiAuth {
                username: cli.api_username,
                password: cli.api_password.filter(|p| !p.is_empty()),
                token: cli.api_token.filter(|t| !t.is_empty()),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["beach-relay"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn defaults_ping_at_ninety_percent_of_pong_wait() {
        let config = parse(&["--pong-wait-ms", "10000"]).unwrap();
        assert_eq!(config.connection.pong_wait, Duration::from_secs(10));
        assert_eq!(config.connection.ping_period, Duration::from_secs(9));
        assert_eq!(config.connection.max_message_size, 4096);
        assert_eq!(config.session.inbound_buffer, 100);
        assert_eq!(config.api_auth.username, "admin");
        assert!(config.api_auth.password.is_none());
    }

    #[test_timeout::timeout]
    fn rejects_ping_period_not_shorter_than_pong_wait() {
        let err = parse(&["--pong-wait-ms", "1000", "--ping-period-ms", "1000"]).unwrap_err();
        assert!(format!("{err:#}").contains("must be shorter"));
    }

    #[test_timeout::timeout]
    fn rejects_invalid_listen_address() {
        let err = parse(&["--listen-addr", "nowhere"]).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test_timeout::timeout]
    fn empty_credentials_are_treated_as_unset() {
        let config = parse(&["--api-password", "", "--api-token", "tok"]).unwrap();
        assert!(config.api_auth.password.is_none());
        assert_eq!(config.api_auth.token.as_deref(), Some("tok"));
    }
}
