use anyhow::{bail, Context};
use clap::Parser;
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use tandem_core::OffererPolicy;

use crate::session::SessionConfig;
use crate::supervisor::ReconnectPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "tandem-server",
    author,
    version,
    about = "Signaling relay pairing one sender with one receiver per session"
)]
pub struct Cli {
    /// Interface to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TANDEM_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Role told to create the initial offer once both roles are present.
    #[arg(long, env = "TANDEM_OFFERER", default_value = "sender")]
    pub offerer: String,

    /// Window for a ready session to reach a stable negotiation.
    #[arg(long, env = "TANDEM_NEGOTIATION_TIMEOUT_SECS", default_value_t = 20)]
    pub negotiation_timeout_secs: u64,

    #[arg(long, env = "TANDEM_RECONNECT_INITIAL_DELAY_MS", default_value_t = 500)]
    pub reconnect_initial_delay_ms: u64,

    #[arg(long, env = "TANDEM_RECONNECT_MAX_DELAY_MS", default_value_t = 8000)]
    pub reconnect_max_delay_ms: u64,

    /// Reconnection attempts before the survivor is disconnected; 0 retries forever.
    #[arg(long, env = "TANDEM_RECONNECT_MAX_ATTEMPTS", default_value_t = 5)]
    pub reconnect_max_attempts: u32,

    #[arg(long, env = "TANDEM_MAX_SESSIONS", default_value_t = 1)]
    pub max_sessions: usize,

    /// Depth of each connection's outbound queue.
    #[arg(long, env = "TANDEM_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Connections silent for this long are dropped.
    #[arg(long, env = "TANDEM_HEARTBEAT_TIMEOUT_SECS", default_value_t = 60)]
    pub heartbeat_timeout_secs: u64,

    /// Interval between WebSocket pings sent to every connection; 0 disables.
    #[arg(long, env = "TANDEM_PING_INTERVAL_SECS", default_value_t = 20)]
    pub ping_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TANDEM_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub session: SessionConfig,
    pub outbound_buffer: usize,
    pub heartbeat_timeout: Duration,
    /// Keeps clients that only answer protocol pings from looking idle.
    pub ping_interval: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            session: SessionConfig::default(),
            outbound_buffer: 64,
            heartbeat_timeout: Duration::from_secs(60),
            ping_interval: Some(Duration::from_secs(20)),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let host: IpAddr = cli
            .host
            .parse()
            .with_context(|| format!("invalid listen host: {}", cli.host))?;
        let offerer: OffererPolicy = cli
            .offerer
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid offerer {:?}; expected sender or receiver", cli.offerer))?;

        if cli.negotiation_timeout_secs == 0 {
            bail!("negotiation timeout must be at least one second");
        }
        if cli.max_sessions == 0 {
            bail!("max sessions must be at least one");
        }
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }
        if cli.reconnect_initial_delay_ms == 0
            || cli.reconnect_initial_delay_ms > cli.reconnect_max_delay_ms
        {
            bail!(
                "reconnect delays must satisfy 0 < initial ({}) <= max ({})",
                cli.reconnect_initial_delay_ms,
                cli.reconnect_max_delay_ms
            );
        }
        if cli.heartbeat_timeout_secs == 0 {
            bail!("heartbeat timeout must be at least one second");
        }
        if cli.ping_interval_secs >= cli.heartbeat_timeout_secs {
            bail!(
                "ping interval ({}s) must be shorter than the heartbeat timeout ({}s)",
                cli.ping_interval_secs,
                cli.heartbeat_timeout_secs
            );
        }

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(host, cli.port),
            session: SessionConfig {
                offerer,
                negotiation_timeout: Duration::from_secs(cli.negotiation_timeout_secs),
                reconnect: ReconnectPolicy {
                    initial_delay: Duration::from_millis(cli.reconnect_initial_delay_ms),
                    max_delay: Duration::from_millis(cli.reconnect_max_delay_ms),
                    max_attempts: (cli.reconnect_max_attempts > 0)
                        .then_some(cli.reconnect_max_attempts),
                },
                max_sessions: cli.max_sessions,
            },
            outbound_buffer: cli.outbound_buffer,
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            ping_interval: (cli.ping_interval_secs > 0)
                .then(|| Duration::from_secs(cli.ping_interval_secs)),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
