//! roomcast-server: real-time room fan-out and fleet-wide presence.
//!
//! Accepts WebSocket connections, authenticates them at upgrade time, and
//! relays room messages, typing signals and presence transitions across a
//! fleet of instances through a shared broadcast fabric.

mod auth;
mod config;
mod drain;
mod fabric;
mod fanout;
mod gateway;
mod handshake;
mod instance;
mod presence;
mod registry;
mod relay;
mod rooms;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use drain::DrainController;
use gateway::{Gateway, Heartbeat};
use handshake::Authenticator;
use instance::{Collaborators, Instance};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often idle rate-limiter entries are dropped.
const LIMITER_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Time given to sessions to write their close frames after a drain.
const CLOSE_LINGER: Duration = Duration::from_millis(200);

/// roomcast-server: room fan-out and presence over WebSocket
#[derive(Parser, Debug)]
#[command(name = "roomcast-server", version, about = "Room fan-out and presence server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Instance id (random if unset)
    #[arg(long)]
    instance_id: Option<String>,

    /// Broadcast fabric URL (redis://… or memory://)
    #[arg(long)]
    fabric_url: Option<String>,

    /// Identity token signing secret
    #[arg(long, env = "ROOMCAST_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Heartbeat ping interval in seconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Seconds of silence before a connection is reaped
    #[arg(long)]
    heartbeat_timeout: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "~/.roomcast/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            bind: self.bind.clone(),
            instance_id: self.instance_id.clone(),
            fabric_url: self.fabric_url.clone(),
            token_secret: self.token_secret.clone(),
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting roomcast-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let collaborators = match Collaborators::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to configure collaborators");
            std::process::exit(1);
        }
    };

    let (fabric, inbound) = match fabric::connect(&config).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, url = %config.fabric_url, "failed to connect to the broadcast fabric");
            std::process::exit(1);
        }
    };

    let instance = Instance::new(&config, fabric, collaborators);
    let pump = tokio::spawn(instance.clone().pump_fabric(inbound));
    let maintenance = tokio::spawn(instance.presence.clone().run(config.liveness_ttl / 3));

    let bind_ip: IpAddr = match config.bind.parse() {
        Ok(ip) => ip,
        Err(e) => {
            error!(error = %e, bind = %config.bind, "invalid bind address");
            std::process::exit(1);
        }
    };
    let authenticator = Arc::new(Authenticator::new(&config));
    let (listener, connections) =
        match transport::start_listener(SocketAddr::new(bind_ip, config.port), authenticator.clone()).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to start listener");
                std::process::exit(1);
            }
        };

    info!(
        instance_id = %config.instance_id,
        addr = %listener.local_addr,
        fabric = %config.fabric_url,
        "roomcast-server ready"
    );

    tokio::spawn(Gateway::new(instance.clone(), Heartbeat::from_config(&config)).serve(connections));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LIMITER_GC_INTERVAL);
        loop {
            tick.tick().await;
            authenticator.gc();
        }
    });

    shutdown_signal().await;
    info!("received shutdown signal");

    maintenance.abort();
    let controller = DrainController::new(instance.clone(), config.drain_grace);
    match tokio::time::timeout(config.drain_timeout, controller.drain(Some(&listener))).await {
        Ok(report) => {
            tokio::time::sleep(CLOSE_LINGER).await;
            info!(closed = report.closed, flushed = report.flushed, "roomcast-server stopped");
        }
        Err(_) => {
            error!(
                timeout_secs = config.drain_timeout.as_secs(),
                "drain did not finish in time, forcing exit"
            );
            std::process::exit(1);
        }
    }
    pump.abort();
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
