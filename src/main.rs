#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # burrow
//!
//! Self-hosted reverse tunnel gateway for NAT'd devices.
//!
//! Edge agents open a persistent outbound WebSocket to the gateway and
//! authenticate with a device token. The gateway terminates public HTTPS
//! (or sits behind a TLS-terminating proxy), resolves the target agent from
//! the request's subdomain, and multiplexes HTTP request/response pairs,
//! browser terminal sessions, and command RPCs over each agent's single
//! connection.
//!
//! ## Subcommands
//!
//! - `burrow serve` — run the gateway server
//! - `burrow start` — run the edge agent on a device
//!
//! ## Server surface
//!
//! | Method | Path                            | Auth   | Description                  |
//! |--------|---------------------------------|--------|------------------------------|
//! | GET    | `/tunnel`                       | token* | Agent WebSocket registration |
//! | ANY    | `https://<sub>.<domain>/<path>` | No     | Proxied to the agent         |
//! | POST   | `/api/register`                 | No     | Register a device            |
//! | GET    | `/api/status`                   | No     | Registry snapshot            |
//! | GET    | `/api/usage`                    | Bearer | Monthly bandwidth usage      |
//! | GET    | `/api/devices/{id}`             | Bearer | Device snapshot + metrics    |
//! | POST   | `/api/devices/{id}/exec`        | Bearer | Remote shell command         |
//! | POST   | `/api/devices/{id}/reboot`      | Bearer | Remote reboot                |
//! | POST   | `/api/devices/{id}/tunnel`      | Bearer | Toggle forwarding            |
//! | GET    | `/api/devices/{id}/terminal`    | token* | Browser terminal WebSocket   |
//!
//! *token in the first frame (`/tunnel`) or a `?token=` query parameter
//! (terminal upgrade), since WebSocket handshakes can't carry headers from
//! browsers.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration for both roles
//! protocol.rs      — framed JSON control messages
//! store.rs         — device identity, subdomain uniqueness, monthly usage
//! util.rs          — hop-by-hop header filtering, host parsing
//! server/
//!   connect.rs     — /tunnel upgrade, auth handshake, per-agent read loop
//!   tunnel.rs      — correlators, terminal sinks, metrics, close semantics
//!   registry.rs    — subdomain → tunnel table
//!   proxy.rs       — public subdomain proxy + bandwidth metering
//!   terminal.rs    — browser terminal bridge
//!   api.rs         — device registration / status / usage / commands
//! agent/
//!   mod.rs         — reconnect state machine, heartbeat, frame dispatch
//!   forwarder.rs   — local HTTP forwarder
//!   pty.rs         — PTY sessions
//!   exec.rs        — remote command execution
//!   metrics.rs     — /proc and /sys metrics collection
//! ```

mod agent;
mod config;
mod protocol;
mod server;
mod store;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use config::{AgentConfig, AgentOverrides, ServerConfig};
use server::registry::TunnelRegistry;
use store::Store;

/// Self-hosted reverse tunnel gateway for NAT'd devices.
#[derive(Parser)]
#[command(name = "burrow", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the edge agent and keep the tunnel connected.
    Start {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Gateway connect URL (overrides config).
        #[arg(long)]
        server: Option<String>,
        /// Device token (overrides config).
        #[arg(long)]
        token: Option<String>,
        /// Local port to forward to (overrides config).
        #[arg(long, short = 'p')]
        port: Option<u16>,
        /// Local host to forward to (overrides config).
        #[arg(long)]
        host: Option<String>,
    },
}

/// Shared server state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<ServerConfig>,
    /// Device identity and usage counters.
    pub store: Arc<Store>,
    /// Live tunnels by subdomain.
    pub registry: Arc<TunnelRegistry>,
    /// Monotonic instant when the server started.
    pub start_time: Instant,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => run_server(config.as_deref()).await,
        Commands::Start {
            config,
            server,
            token,
            port,
            host,
        } => {
            let overrides = AgentOverrides {
                server,
                token,
                local_host: host,
                local_port: port,
            };
            run_agent(config.as_deref(), overrides).await;
        }
    }
}

fn init_tracing(level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config_path: Option<&str>) {
    let config = match ServerConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("burrow: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging.level);

    info!("burrow v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Base domain: {}", config.server.base_domain);
    info!("Listening on {}", config.server.listen);
    if config.server.dev_mode {
        info!("Dev mode: subdomain accepted from header/query");
    }

    let store = Arc::new(Store::new());
    let state = AppState {
        config: Arc::new(config),
        registry: Arc::new(TunnelRegistry::new(Arc::clone(&store))),
        store,
        start_time: Instant::now(),
    };

    let api_routes = Router::new()
        .route("/api/register", post(server::api::register))
        .route("/api/status", get(server::api::status))
        .route("/api/usage", get(server::api::usage))
        .route("/api/devices/{id}", get(server::api::get_device))
        .route("/api/devices/{id}/exec", post(server::api::exec))
        .route("/api/devices/{id}/reboot", post(server::api::reboot))
        .route(
            "/api/devices/{id}/tunnel",
            post(server::api::set_tunnel_enabled),
        )
        .route(
            "/api/devices/{id}/terminal",
            get(server::terminal::terminal_upgrade),
        );

    // The subdomain gate runs in front of everything: requests whose Host
    // names a tunnel subdomain are proxied and never reach the inner router.
    let app = Router::new()
        .route("/tunnel", get(server::connect::tunnel_upgrade))
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            server::proxy::subdomain_gate,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .unwrap_or_else(|e| {
            eprintln!("burrow: failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        });

    info!("Server ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    info!("Goodbye");
}

async fn run_agent(config_path: Option<&str>, overrides: AgentOverrides) {
    let config = match AgentConfig::load(config_path, &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("burrow: {e}");
            std::process::exit(1);
        }
    };

    init_tracing("info");

    info!("burrow agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Forwarding to http://{}:{}",
        config.local_host, config.local_port
    );

    // Local stop: flip the shutdown signal; the client closes the connection,
    // kills PTY children, and does not retry.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    agent::run(config, shutdown_rx).await;
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
