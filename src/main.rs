//! Resilience plane demo server.
//!
//! Hosts a small business router behind the full admission chain:
//!
//! ```text
//!     Client Request
//!     ───▶ request id ─▶ trace ─▶ metrics
//!          ─▶ rate limit ─▶ concurrency ─▶ timeout ─▶ circuit breaker ─▶ handler
//!
//!     Background: store health monitor, token bucket sweeper,
//!                 memory store expiry sweeper, event drain
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Json, Router};
use clap::Parser;
use tokio::net::TcpListener;

use resilience_plane::config::{load_config, validation::validate_config, ResilienceConfig, StoreKind};
use resilience_plane::lifecycle::{wait_for_signal, Shutdown};
use resilience_plane::observability::{logging, metrics, EventSink};
use resilience_plane::store::{CounterStore, MemoryStore, RedisStore};
use resilience_plane::{HttpServer, ResilienceState};

#[derive(Parser)]
#[command(name = "resilience-plane")]
#[command(about = "Circuit breaking and rate limiting in front of an HTTP service", long_about = None)]
struct Args {
    /// TOML configuration file. Defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ResilienceConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
        if let Err(errors) = validate_config(&config) {
            for e in &errors {
                eprintln!("invalid configuration: {}", e);
            }
            return Err("invalid configuration".into());
        }
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resilience-plane starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        strategy = %config.rate_limit.strategy,
        store = ?config.store.kind,
        max_in_flight = config.concurrency.max_in_flight,
        request_timeout_ms = config.timeouts.request_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    let mut background = Vec::new();

    let store: Arc<dyn CounterStore> = match (&config.store.kind, &config.store.url) {
        (StoreKind::Redis, Some(url)) => match RedisStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to counter store");
                return Err(e.into());
            }
        },
        _ => {
            let store = Arc::new(MemoryStore::new());
            background.push(store.clone().spawn_expiry_sweeper(Duration::from_secs(30), shutdown.subscribe()));
            store
        }
    };

    let (events, drain) = EventSink::channel(config.observability.event_buffer);
    background.push(drain.spawn(shutdown.subscribe()));

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let state = ResilienceState::new(config, store, Some(events));
    let server = HttpServer::new(state, demo_routes());

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        if trigger.trigger() {
            tracing::info!("Shutdown signal received, draining");
        }
    });

    server.run(listener, shutdown).await?;
    for handle in background {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn demo_routes() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/api/items",
            get(|| async { Json(serde_json::json!({ "items": ["alpha", "beta", "gamma"] })) }),
        )
        .route(
            "/api/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "slow"
            }),
        )
        .route(
            "/api/flaky",
            get(|| async {
                if fastrand::u8(..10) < 3 {
                    (StatusCode::BAD_GATEWAY, "upstream failed")
                } else {
                    (StatusCode::OK, "ok")
                }
            }),
        )
}
