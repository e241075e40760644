//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::Request;
use axum::response::Response;
use axum::Router;

use resilience_plane::config::ResilienceConfig;
use resilience_plane::store::{CounterStore, MemoryStore, StoreError, StoreResult, WindowDecision};
use resilience_plane::{HttpServer, ResilienceState};

pub const ADMIN_KEY: &str = "test-admin-key";

/// Defaults with metrics off and `X-Forwarded-For` trusted so tests can
/// pick the client IP per request.
pub fn config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.observability.metrics_enabled = false;
    config.listener.trust_forwarded_for = true;
    config
}

pub fn state(config: ResilienceConfig) -> ResilienceState {
    ResilienceState::new(config, Arc::new(MemoryStore::new()), None)
}

/// Full middleware stack around `business`, reachable through `oneshot`.
pub fn app(state: ResilienceState, business: Router) -> (Router, ResilienceState) {
    let server = HttpServer::new(state, business);
    let state = server.state().clone();
    let router = server
        .router()
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40_000))));
    (router, state)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_from(uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

pub fn admin(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", ADMIN_KEY))
        .body(Body::empty())
        .unwrap()
}

pub async fn json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A counter store whose every call fails.
#[derive(Debug)]
pub struct UnreachableStore;

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("connection refused".into()))
}

#[async_trait]
impl CounterStore for UnreachableStore {
    fn backend(&self) -> &'static str {
        "unreachable"
    }

    async fn sliding_window_admit(&self, _: &str, _: Duration, _: Duration, _: u64, _: u64) -> StoreResult<WindowDecision> {
        down()
    }

    async fn sliding_window_count(&self, _: &str, _: Duration, _: Duration) -> StoreResult<u64> {
        down()
    }

    async fn fixed_window_admit(&self, _: &str, _: u64, _: u64, _: Duration) -> StoreResult<WindowDecision> {
        down()
    }

    async fn counter(&self, _: &str) -> StoreResult<u64> {
        down()
    }

    async fn delete(&self, _: &str) -> StoreResult<()> {
        down()
    }

    async fn delete_prefix(&self, _: &str) -> StoreResult<u64> {
        down()
    }

    async fn ping(&self) -> StoreResult<()> {
        down()
    }
}
