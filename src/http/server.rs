//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the shared `ResilienceState` from configuration
//! - Wrap a caller-supplied business `Router` in the protective layers
//! - Mount the admin API beside it
//! - Wire up ambient middleware (tracing, request ID, request metrics)
//! - Start background tasks and serve until shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{middleware, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::admin;
use crate::clock::{self, SharedClock};
use crate::config::ResilienceConfig;
use crate::http::middleware::{
    circuit_breaker_middleware, concurrency_middleware, rate_limit_middleware, timeout_middleware,
    track_requests, ConcurrencyGate, RejectionHandler,
};
use crate::http::request::{header_key, request_id_layers, CustomKeyFn};
use crate::lifecycle::Shutdown;
use crate::limiter::{KeyRules, LimiterDispatcher, LimiterManager};
use crate::observability::events::EventSink;
use crate::resilience::BreakerRegistry;
use crate::store::{CounterStore, DegradationLatch, StoreHealthMonitor};

/// Shared state injected into every layer and admin handler.
#[derive(Clone)]
pub struct ResilienceState {
    pub config: Arc<ResilienceConfig>,
    pub breakers: Arc<BreakerRegistry>,
    pub limiters: Arc<LimiterManager>,
    pub dispatcher: Arc<LimiterDispatcher>,
    pub store: Arc<dyn CounterStore>,
    pub gate: Arc<ConcurrencyGate>,
    pub custom_key: Option<CustomKeyFn>,
    pub on_rejected: Option<RejectionHandler>,
    pub started: Instant,
}

impl ResilienceState {
    pub fn new(config: ResilienceConfig, store: Arc<dyn CounterStore>, events: Option<EventSink>) -> Self {
        Self::with_clock(config, store, events, clock::system())
    }

    pub fn with_clock(
        config: ResilienceConfig,
        store: Arc<dyn CounterStore>,
        events: Option<EventSink>,
        clock: SharedClock,
    ) -> Self {
        let mut latch = DegradationLatch::new(config.rate_limit.failure_policy);
        let mut breakers = BreakerRegistry::with_clock(clock.clone());
        if let Some(sink) = &events {
            latch = latch.with_events(sink.clone());
            breakers = breakers.with_events(sink.clone());
        }

        let limiters = Arc::new(LimiterManager::from_config(
            &config.rate_limit,
            store.clone(),
            Arc::new(latch),
            clock,
        ));

        let mut dispatcher = LimiterDispatcher::new(limiters.clone(), KeyRules::from(&config.rate_limit.keys))
            .with_max_wait(config.rate_limit.max_wait())
            .with_quota_hints(config.rate_limit.quota_headers);
        if let Some(sink) = events {
            dispatcher = dispatcher.with_events(sink);
        }

        let custom_key = config.rate_limit.custom_key_header.as_deref().map(header_key);
        let gate = Arc::new(ConcurrencyGate::new(config.concurrency.max_in_flight));

        Self {
            config: Arc::new(config),
            breakers: Arc::new(breakers),
            limiters,
            dispatcher: Arc::new(dispatcher),
            store,
            gate,
            custom_key,
            on_rejected: None,
            started: Instant::now(),
        }
    }

    /// Replace the custom limiter key source (the configured header by default).
    pub fn with_custom_key(mut self, f: CustomKeyFn) -> Self {
        self.custom_key = Some(f);
        self
    }

    /// Replace the default 429 response.
    pub fn with_rejection_handler(mut self, handler: RejectionHandler) -> Self {
        self.on_rejected = Some(handler);
        self
    }
}

/// HTTP server hosting a business router behind the resilience layers.
pub struct HttpServer {
    state: ResilienceState,
    router: Router,
}

impl HttpServer {
    pub fn new(state: ResilienceState, business: Router) -> Self {
        let router = Self::build_router(&state, business);
        Self { state, router }
    }

    /// Layer order, outermost first: rate limit, concurrency, timeout,
    /// breaker. The breaker is a route layer so unmatched paths never
    /// create breakers.
    pub fn build_router(state: &ResilienceState, business: Router) -> Router {
        let protected = business
            .route_layer(middleware::from_fn_with_state(state.clone(), circuit_breaker_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), timeout_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), concurrency_middleware))
            .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware));

        let mut app = protected;
        if state.config.admin.enabled {
            app = app.merge(admin::setup_admin_router(state.clone()));
        }

        let (set_request_id, propagate_request_id) = request_id_layers();
        app.layer(middleware::from_fn(track_requests))
            .layer(TraceLayer::new_for_http())
            .layer(propagate_request_id)
            .layer(set_request_id)
    }

    pub fn state(&self) -> &ResilienceState {
        &self.state
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Store health monitor and the limiter sweepers, all stopped by
    /// `shutdown`.
    pub fn spawn_background(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let config = &self.state.config;

        if config.rate_limit.enabled && config.rate_limit.strategy.is_distributed() {
            let monitor = StoreHealthMonitor::new(
                self.state.store.clone(),
                self.state.limiters.latch().clone(),
                Duration::from_millis(config.store.health_check_interval_ms),
            );
            handles.push(tokio::spawn(monitor.run(shutdown.subscribe())));
        }

        if config.rate_limit.enabled {
            let shortest = config.rate_limit.sliding_window.window().min(config.rate_limit.fixed_window.window());
            let every = shortest.clamp(Duration::from_secs(1), Duration::from_secs(60));
            handles.push(self.state.limiters.clone().spawn_stats_sweeper(every, shutdown.subscribe()));
        }

        let idle = config.rate_limit.token_bucket.idle_eviction_secs;
        if idle > 0 {
            let idle = Duration::from_secs(idle);
            let every = (idle / 4).max(Duration::from_secs(1));
            handles.push(self.state.limiters.token_bucket().clone().spawn_idle_sweeper(
                every,
                idle,
                shutdown.subscribe(),
            ));
        }

        handles
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let background = self.spawn_background(&shutdown);

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        // serve can also end on a listener error; stop the background tasks too
        shutdown.trigger();
        for handle in background {
            let _ = handle.await;
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
