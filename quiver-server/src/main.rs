//! # Quiver Server
//!
//! Serverless function runtime server. Hosts user-authored handler files and
//! invokes them for HTTP requests, cron schedules, Postgres change
//! notifications, application events, one-shot bootstrap runs, and webhook
//! deliveries, reporting every execution to the Backend control plane.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - PostgreSQL LISTEN/NOTIFY for database triggers
//! - A configurable script runtime (Deno by default) to host handler files
//! - Filesystem watching for hot reload
//! - An outbound HTTP client for execution-result reporting

/// CORS policy middleware
pub mod cors;

/// Error types and handling
pub mod error;

/// Endpoint handlers
pub mod handlers;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{any, delete, get, post},
};
use clap::Parser;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiver_core::watcher::watch_functions_dir;
use quiver_core::{Config, Runtime};

/// Command line arguments for the Quiver function runtime
#[derive(Parser, Debug)]
#[command(name = "quiver-server")]
#[command(about = "Serverless function runtime with HTTP, cron, database, event, and webhook triggers")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

/// Server application state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration from environment
    let mut config = Config::from_env()?;

    // Override config with CLI arguments if provided
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(host) = args.host {
        config.server_host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "quiver_server=debug,quiver_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Server configuration loaded");
    info!("Functions directory: {}", config.functions_dir.display());

    let functions_dir = config.functions_dir.clone();
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    let runtime = Runtime::new(config).await?;

    // Initial scan registers every deployed function and bootstraps pending
    // run-once handlers.
    let loaded = runtime.scan_and_reload().await;
    info!("Loaded {} function(s)", loaded);

    runtime.spawn_scheduler();

    // Filesystem watcher: debounced changes collapse into registry rescans.
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let _watcher = match watch_functions_dir(&functions_dir, reload_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("File watching disabled: {}", e);
            None
        }
    };
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                runtime.scan_and_reload().await;
            }
        });
    }

    let state = AppState { runtime };
    let app = create_app(state);

    let addr: SocketAddr = format!("{server_host}:{server_port}").parse()?;
    info!("Starting Quiver function runtime on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the full HTTP surface. Static control routes win over the
/// per-function catch-alls.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/functions", get(handlers::list_functions))
        .route("/function-status/{name}", get(handlers::function_status))
        .route("/reload", any(handlers::reload))
        .route("/deploy", post(handlers::deploy))
        .route("/deploy/{name}", delete(handlers::undeploy))
        .route("/emit-event", post(handlers::emit_event))
        .route("/db-notify", post(handlers::db_notify))
        .route("/webhook/{name}", post(handlers::webhook))
        .route("/{name}", any(handlers::invoke))
        .route("/{name}/{*rest}", any(handlers::invoke_subpath))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors::cors_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
