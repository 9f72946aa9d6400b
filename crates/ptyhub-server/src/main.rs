//! ptyhub-server: multiplexed shell sessions over WebSocket.
//!
//! Hosts named PTY sessions that any number of browser or CLI clients can
//! switch between, plus a `/p/<port>/` reverse proxy to loopback services.

mod config;
mod http;
mod hub;
mod proxy;
mod rate_limit;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use hub::Hub;
use ptyhub_core::PROTOCOL_VERSION;
use server::HubServer;
use session::NativePtySpawner;
use std::path::PathBuf;
use tracing::{error, info};

/// ptyhub-server: shared terminal sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "ptyhub-server", version, about = "Shared PTY sessions over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "PTYHUB_BIND")]
    bind: Option<String>,

    /// Shell command for new sessions
    #[arg(long, env = "PTYHUB_SHELL")]
    shell: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long, env = "PTYHUB_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Scrollback kept per session, in bytes
    #[arg(long, env = "PTYHUB_HISTORY_BYTES")]
    history_bytes: Option<usize>,

    /// Input burst allowance per connection, in bytes
    #[arg(long, env = "PTYHUB_INPUT_BURST")]
    input_burst: Option<u32>,

    /// Sustained input rate per connection, in bytes per second
    #[arg(long, env = "PTYHUB_INPUT_RATE")]
    input_rate: Option<u32>,

    /// Proxy connect + response timeout in seconds
    #[arg(long, env = "PTYHUB_PROXY_TIMEOUT")]
    proxy_timeout: Option<u64>,

    /// Config file path
    #[arg(long, env = "PTYHUB_CONFIG", default_value = "~/.ptyhub/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            bind: self.bind.clone(),
            shell: self.shell.clone(),
            max_sessions: self.max_sessions,
            history_bytes: self.history_bytes,
            input_burst: self.input_burst,
            input_rate: self.input_rate,
            proxy_timeout_secs: self.proxy_timeout,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), cli.overrides()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = PROTOCOL_VERSION,
        addr = %config.listen_addr(),
        shell = %config.shell,
        "starting ptyhub-server"
    );

    let spawner = NativePtySpawner::new(config.shell.clone());
    let (mut hub, handle) = Hub::new(config.registry_settings(), Box::new(spawner));
    match hub.bootstrap() {
        Ok(first) => info!(session_id = %first.id, name = %first.display_name, "initial session ready"),
        Err(e) => {
            error!(error = %e, "failed to start initial session");
            std::process::exit(1);
        }
    }
    let hub_task = tokio::spawn(hub.run());

    let server = match HubServer::bind(&config, config.listen_addr(), handle.clone()).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    let shutdown_tx = server.shutdown_sender();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = handle.shutdown().await;
    let _ = hub_task.await;
    info!("ptyhub-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
