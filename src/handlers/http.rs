//! HTTP adjuncts: health, stats, ICE servers and the rate-limit middleware.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::handlers::ice;
use crate::ratelimit::client_ip;
use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "time": chrono::Utc::now().to_rfc3339(),
        "environment": state.config.environment.as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let pool = state.pool.stats().await;
    Json(serde_json::json!({
        "waiting_users": pool.waiting_users,
        "active_users": pool.active_users,
        "active_rooms": pool.active_rooms,
        "rate_limiter": state.rate_limiter.stats(),
        "server_started_at": state.started_at.to_rfc3339(),
    }))
}

pub async fn ice_servers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "iceServers": ice::ice_servers(&state.config),
    }))
}

/// Per-source HTTP rate limiting. Every response carries the limit headers;
/// a shed request gets 429 with `Retry-After`.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(request.headers(), peer);
    let decision = state.rate_limiter.check_http(ip);

    if !decision.allowed {
        tracing::warn!(%ip, "HTTP request rate limited");
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("retry-after", HeaderValue::from_static("60"));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    response
}
