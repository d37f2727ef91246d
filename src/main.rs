//! Signaling and matchmaking server for random-pairing P2P voice chat.

mod config;
mod handlers;
mod pool;
mod protocol;
mod ratelimit;
mod state;
mod token;
mod validation;

use axum::{
    http::HeaderValue,
    middleware,
    response::Html,
    routing::get,
    Router,
};
use config::Config;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often quiet rate-limiter buckets are swept out.
const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(AppState::new(config));

    // Idle-session reaper: the only scheduled mutator of the pool.
    let reaper_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_state.config.cleanup_interval);
        loop {
            interval.tick().await;
            if reaper_state.pool.is_shutting_down() {
                break;
            }
            let reaped = reaper_state
                .pool
                .reap_idle(reaper_state.config.idle_cutoff)
                .await;
            if reaped > 0 {
                tracing::info!(reaped, "idle session sweep completed");
            }
        }
    });

    // Rate-limiter bucket pruner.
    let pruner_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            if pruner_state.pool.is_shutting_down() {
                break;
            }
            pruner_state.rate_limiter.prune();
        }
    });

    let cors = build_cors(&state.config.allowed_origins);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(handlers::http::health))
        .route("/stats", get(handlers::http::stats))
        .route("/ice-servers", get(handlers::http::ice_servers))
        .route("/ws", get(handlers::connection::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::http::rate_limit,
        ))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "failed to bind listen address");
            std::process::exit(1);
        }
    };

    tracing::info!(
        %addr,
        environment = state.config.environment.as_str(),
        "voicepair signaling server started"
    );
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    let shutdown_state = state.clone();
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_state))
    .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }

    tracing::info!("server exited gracefully");
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring unparseable allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>voicepair signaling server</h1><p>WebSocket endpoint: /ws</p>")
}

/// Wait for SIGINT/SIGTERM, then close every live session so each runs its
/// normal teardown while the HTTP server drains.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, closing sessions");
    state.pool.close_all().await;
}
