mod auth;
mod bus;
mod cache;
mod config;
mod error;
mod memory;
mod metrics;
mod resources;
mod rpc;
mod search;
mod sessions;
mod stdio;
mod storage;
mod tools;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::rpc::{ServerContext, SharedContext};
use crate::storage::Storage;
use quorum_protocol::config::Transport;

// Process exit codes: 0 normal, 2 configuration error, 3 storage init
// failure, 4 fatal runtime error.
const EXIT_CONFIG: i32 = 2;
const EXIT_STORAGE: i32 = 3;
const EXIT_RUNTIME: i32 = 4;

/// Cadence of the background janitors (token cleanup, memory TTL sweep).
const JANITOR_INTERVAL: Duration = Duration::from_secs(300);

/// Command-line overrides. Flags win over both the config file and the
/// environment: `--config <path>`, `--port <port>`,
/// `--transport <stdio|http>`.
#[derive(Debug)]
struct CliArgs {
    config_path: PathBuf,
    port: Option<u16>,
    transport: Option<Transport>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./config/quorum.toml"),
            port: None,
            transport: None,
        }
    }
}

fn parse_args() -> CliArgs {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> CliArgs {
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    cli.config_path = PathBuf::from(path);
                }
            }
            "--port" | "-p" => {
                cli.port = args.next().and_then(|p| p.parse().ok());
            }
            "--transport" | "-t" => {
                cli.transport = match args.next().as_deref() {
                    Some("stdio") => Some(Transport::Stdio),
                    Some("http") => Some(Transport::Http),
                    other => {
                        eprintln!(
                            "warning: unrecognized transport {other:?}, expected stdio or http"
                        );
                        None
                    }
                };
            }
            other => {
                eprintln!("warning: ignoring unrecognized argument {other:?}");
            }
        }
    }

    cli
}

#[tokio::main]
async fn main() {
    // Initialize tracing. With the stdio transport, stdout belongs to the
    // protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args();

    // Load configuration
    let mut config = match config::load_config(&cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(p) = cli.port {
        config.server.http_port = p;
    }
    if let Some(t) = cli.transport {
        config.server.transport = t;
    }

    // Validate configuration semantics
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(EXIT_CONFIG);
        }
    }

    // Open storage and run migrations
    let storage = match Storage::connect(&config.database).await {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            tracing::error!("Storage initialization failed: {e}");
            std::process::exit(EXIT_STORAGE);
        }
    };
    tracing::info!(
        revision = storage.migration_revision(),
        url = %config.database.url,
        "Storage ready"
    );

    let transport = config.server.transport;
    let bind_addr: SocketAddr =
        match format!("{}:{}", config.server.http_host, config.server.http_port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("Invalid bind address: {e}");
                std::process::exit(EXIT_CONFIG);
            }
        };

    let ctx = match ServerContext::with_storage(config, storage) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Failed to assemble server context: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    spawn_janitors(Arc::clone(&ctx));

    // Print startup banner
    tracing::info!("===========================================");
    tracing::info!(
        "  Quorum Coordination Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    match transport {
        Transport::Http => tracing::info!("  MCP over http://{bind_addr}/mcp/"),
        Transport::Stdio => tracing::info!("  MCP over stdio (line-delimited JSON)"),
    }
    tracing::info!("===========================================");

    let result = match transport {
        Transport::Stdio => {
            // The dashboard data feed (WebSocket push + health) keeps its
            // HTTP listener even when MCP itself runs over stdio.
            let feed = spawn_feed_listener(Arc::clone(&ctx), bind_addr);
            let result = run_stdio(Arc::clone(&ctx)).await;
            feed.abort();
            result
        }
        Transport::Http => run_http(Arc::clone(&ctx), bind_addr).await,
    };

    // Teardown order: transports have stopped; subscribers drain as their
    // connections drop; then the pool closes.
    if let Err(e) = &result {
        tracing::error!("Fatal runtime error: {e:#}");
    }
    ctx.storage.close().await;

    match result {
        Ok(()) => tracing::info!("Quorum server shut down cleanly"),
        Err(_) => std::process::exit(EXIT_RUNTIME),
    }
}

/// Periodic maintenance: expired-token cleanup and the memory TTL sweep.
fn spawn_janitors(ctx: SharedContext) {
    let vault_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.tick().await; // skip the immediate tick
        loop {
            ticker.tick().await;
            match vault_ctx.vault.cleanup().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Token cleanup pass complete");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Token cleanup failed: {e}"),
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match ctx.memory.sweep_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Memory sweep removed expired entries");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Memory sweep failed: {e}"),
            }
        }
    });
}

fn spawn_feed_listener(
    ctx: SharedContext,
    bind_addr: SocketAddr,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!("Dashboard feed listener failed to bind {bind_addr}: {e}");
                return;
            }
        };
        tracing::info!("Dashboard feed listening on http://{bind_addr}");
        let app = web::build_feed_router(ctx);
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("Dashboard feed listener exited: {e}");
        }
    })
}

async fn run_stdio(ctx: SharedContext) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = stdio::run(ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
            Ok(())
        }
    }
}

async fn run_http(ctx: SharedContext, bind_addr: SocketAddr) -> anyhow::Result<()> {
    let app = web::build_router(ctx)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("Server ready, accepting connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        parse_args_from(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_when_no_args() {
        let cli = parse(&[]);
        assert_eq!(cli.config_path, PathBuf::from("./config/quorum.toml"));
        assert!(cli.port.is_none());
        assert!(cli.transport.is_none());
    }

    #[test]
    fn config_and_port_flags() {
        let cli = parse(&["--config", "/etc/quorum.toml", "-p", "9100"]);
        assert_eq!(cli.config_path, PathBuf::from("/etc/quorum.toml"));
        assert_eq!(cli.port, Some(9100));
    }

    #[test]
    fn transport_flag_accepts_both_modes() {
        assert_eq!(parse(&["--transport", "stdio"]).transport, Some(Transport::Stdio));
        assert_eq!(parse(&["-t", "http"]).transport, Some(Transport::Http));
        assert!(parse(&["--transport", "carrier-pigeon"]).transport.is_none());
    }

    #[test]
    fn malformed_values_fall_back() {
        let cli = parse(&["--port", "not-a-port", "--bogus-flag"]);
        assert!(cli.port.is_none());
        assert_eq!(cli.config_path, PathBuf::from("./config/quorum.toml"));
    }

    #[test]
    fn trailing_flag_without_value_is_tolerated() {
        let cli = parse(&["--config"]);
        assert_eq!(cli.config_path, PathBuf::from("./config/quorum.toml"));
    }
}
