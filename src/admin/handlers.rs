use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ResilienceError;
use crate::http::response::rejection_response;
use crate::http::server::ResilienceState;
use crate::limiter::manager::KeyListing;
use crate::limiter::{LimitStats, LimiterError, Strategy};
use crate::resilience::{BreakerState, BreakerStats};
use crate::store::FailurePolicy;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub store: StoreStatus,
    pub breakers: BreakerSummary,
}

#[derive(Serialize)]
pub struct StoreStatus {
    pub backend: &'static str,
    pub degraded: bool,
    pub failure_policy: FailurePolicy,
    pub incidents: u64,
}

#[derive(Serialize)]
pub struct BreakerSummary {
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub key: String,
    pub strategy: Option<Strategy>,
}

fn limiter_error(err: LimiterError) -> Response {
    match err {
        LimiterError::Store(e) => rejection_response(&ResilienceError::InfrastructureUnavailable(e), None),
        other => (StatusCode::BAD_REQUEST, other.to_string()).into_response(),
    }
}

pub async fn get_status(State(state): State<ResilienceState>) -> Json<SystemStatus> {
    let latch = state.limiters.latch();
    let breakers = state.breakers.snapshot();
    let count = |s: BreakerState| breakers.iter().filter(|b| b.state == s).count();

    let degraded = latch.is_degraded();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if degraded { "degraded" } else { "operational" },
        uptime_secs: state.started.elapsed().as_secs(),
        in_flight: state.gate.in_flight(),
        max_in_flight: state.gate.max(),
        store: StoreStatus {
            backend: state.store.backend(),
            degraded,
            failure_policy: latch.policy(),
            incidents: latch.incidents(),
        },
        breakers: BreakerSummary {
            total: breakers.len(),
            open: count(BreakerState::Open),
            half_open: count(BreakerState::HalfOpen),
        },
    })
}

pub async fn get_breakers(State(state): State<ResilienceState>) -> Json<Vec<BreakerStats>> {
    Json(state.breakers.snapshot())
}

pub async fn reset_breaker(State(state): State<ResilienceState>, Path(name): Path<String>) -> Response {
    match state.breakers.reset(&name) {
        Ok(stats) => {
            tracing::info!(breaker = %name, "Circuit breaker reset via admin API");
            Json(stats).into_response()
        }
        Err(e) => rejection_response(&e, None),
    }
}

pub async fn get_limits(State(state): State<ResilienceState>) -> Json<Vec<KeyListing>> {
    Json(state.limiters.keys())
}

pub async fn get_limit_stats(
    State(state): State<ResilienceState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let strategy = query.strategy.unwrap_or(state.limiters.default_strategy());
    match state.limiters.stats(strategy, &query.key).await {
        Ok(stats) => Json::<LimitStats>(stats).into_response(),
        Err(e) => limiter_error(e),
    }
}

pub async fn reset_limit(
    State(state): State<ResilienceState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let strategy = query.strategy.unwrap_or(state.limiters.default_strategy());
    match state.limiters.reset(strategy, &query.key).await {
        Ok(()) => Json(serde_json::json!({
            "key": query.key,
            "strategy": strategy,
            "reset": true,
        }))
        .into_response(),
        Err(e) => limiter_error(e),
    }
}
