use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use axum::http::HeaderValue;
use clap::Parser;

use crate::hub::HubConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub internal_addr: SocketAddr,
    pub allowed_origin: HeaderValue,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reaper_interval: Duration,
    pub status_interval: Duration,
    pub connection_buffer: usize,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            per_connection_buffer: self.connection_buffer,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-classroom",
    author,
    version,
    about = "Presence and call signaling hub for Beach tutoring sessions"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(
        long,
        env = "BEACH_CLASSROOM_LISTEN_ADDR",
        default_value = "127.0.0.1:3000"
    )]
    pub listen_addr: String,

    /// Address for the collaborator push/presence API. Keep it off the
    /// public network.
    #[arg(
        long,
        env = "BEACH_CLASSROOM_INTERNAL_ADDR",
        default_value = "127.0.0.1:3001"
    )]
    pub internal_addr: String,

    /// Browser origin allowed to open websocket and HTTP requests.
    #[arg(
        long,
        env = "BEACH_CLASSROOM_ALLOWED_ORIGIN",
        default_value = "http://localhost:5173"
    )]
    pub allowed_origin: String,

    /// How often the server pings each client.
    #[arg(
        long,
        env = "BEACH_CLASSROOM_HEARTBEAT_INTERVAL_SECS",
        default_value_t = 25
    )]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a client is considered gone.
    #[arg(
        long,
        env = "BEACH_CLASSROOM_HEARTBEAT_TIMEOUT_SECS",
        default_value_t = 60
    )]
    pub heartbeat_timeout_secs: u64,

    /// Stale connection sweep cadence; 0 disables the sweep.
    #[arg(long, env = "BEACH_CLASSROOM_REAPER_INTERVAL_SECS", default_value_t = 30)]
    pub reaper_interval_secs: u64,

    /// Status report cadence; 0 disables the report.
    #[arg(long, env = "BEACH_CLASSROOM_STATUS_INTERVAL_SECS", default_value_t = 60)]
    pub status_interval_secs: u64,

    /// Outbound frames buffered per connection before frames are dropped.
    #[arg(long, env = "BEACH_CLASSROOM_CONNECTION_BUFFER", default_value_t = 64)]
    pub connection_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_CLASSROOM_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let internal_addr: SocketAddr = cli
            .internal_addr
            .parse()
            .with_context(|| format!("invalid internal address: {}", cli.internal_addr))?;
        if internal_addr == listen_addr {
            bail!("internal address must differ from the public listen address");
        }
        let allowed_origin = HeaderValue::from_str(cli.allowed_origin.trim())
            .with_context(|| format!("invalid allowed origin: {}", cli.allowed_origin))?;

        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        if cli.heartbeat_timeout_secs <= cli.heartbeat_interval_secs {
            bail!(
                "heartbeat timeout ({}s) must exceed heartbeat interval ({}s)",
                cli.heartbeat_timeout_secs,
                cli.heartbeat_interval_secs
            );
        }
        if cli.connection_buffer == 0 {
            bail!("connection buffer must hold at least one frame");
        }

        Ok(ServerConfig {
            listen_addr,
            internal_addr,
            allowed_origin,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            reaper_interval: Duration::from_secs(cli.reaper_interval_secs),
            status_interval: Duration::from_secs(cli.status_interval_secs),
            connection_buffer: cli.connection_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
