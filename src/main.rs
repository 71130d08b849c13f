#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # backhaul
//!
//! Single-tunnel reverse proxy. A private tunnel client dials out to the
//! relay over one WebSocket; the relay forwards every public HTTP request
//! and WebSocket through it, so the private side needs no public address.
//!
//! ## Subcommands
//!
//! - `backhaul serve` (default): run the public relay
//! - `backhaul connect`: run the tunnel client against a local backend
//!
//! ## Endpoints (serve)
//!
//! | Path            | Description                                        |
//! |-----------------|----------------------------------------------------|
//! | `tunnel.path`   | Control WebSocket for the tunnel client            |
//! | anything else   | Forwarded through the tunnel (HTTP or WebSocket)   |
//!
//! Public requests get `503` while no authenticated tunnel is connected.
//!
//! ## Architecture
//!
//! ```text
//! main.rs           entry point, clap subcommands, graceful shutdown
//! config.rs         TOML + env-var configuration
//! auth.rs           shared-token check, constant-time comparison
//! error.rs          typed errors
//! state.rs          AppState shared by handlers
//! tunnel/
//!   frame.rs        control messages, CHNK frames, incremental decoder
//!   streams.rs      stream table (correlation id → stream state)
//!   session.rs      tunnel session + single-session slot
//!   ingress.rs      public HTTP / WebSocket → tunnel
//!   demux.rs        tunnel → public responses / sockets
//!   relay.rs        router, control connection loops
//!   client.rs       private tunnel client
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use backhaul::tunnel;
use backhaul::{AppState, Config};

/// Single-tunnel reverse proxy.
#[derive(Parser)]
#[command(name = "backhaul", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Connect to a relay and serve its traffic from a local backend.
    Connect {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (connect, config_path) = match cli.command {
        Some(Commands::Connect { config }) => (true, config),
        Some(Commands::Serve { config }) => (false, config),
        None => (false, None),
    };

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("backhaul: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if config.uses_default_token() {
        warn!("Using default tunnel token; set BACKHAUL_TOKEN or update config");
    }

    if connect {
        run_client(config).await
    } else {
        run_server(config).await
    }
}

async fn run_server(config: Arc<Config>) -> ExitCode {
    info!("backhaul v{} starting", env!("CARGO_PKG_VERSION"));

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.server.listen);
            return ExitCode::FAILURE;
        }
    };
    info!("Listening on {}", config.server.listen);
    info!("Tunnel control path: {}", config.tunnel.path);

    let state = AppState::new(config);
    let app = tunnel::relay::router(state.clone());

    // Closing the tunnel finalizes every in-flight public request.
    let slot = state.tunnel.clone();
    let shutdown = async move {
        shutdown_signal().await;
        slot.shutdown().await;
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Goodbye after {}s", state.start_time.elapsed().as_secs());
    ExitCode::SUCCESS
}

async fn run_client(config: Arc<Config>) -> ExitCode {
    info!("backhaul v{} connecting, target {}", env!("CARGO_PKG_VERSION"), config.client.target);
    tokio::select! {
        result = tunnel::client::run(config) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Tunnel client stopped: {e}");
                ExitCode::FAILURE
            }
        },
        () = shutdown_signal() => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
