//! Process-wide application state.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::Config;
use crate::pool::UserPool;
use crate::ratelimit::RateLimiter;

/// Everything the handlers share: the matchmaking pool, the rate limiter and
/// the static configuration. Both stateful members synchronize internally.
pub struct AppState {
    pub pool: UserPool,
    pub rate_limiter: RateLimiter,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let rate_limiter = RateLimiter::new(
            config.http_rate_per_minute,
            config.ws_rate_per_minute,
            config.max_ws_conn_per_ip,
        );
        Self {
            pool: UserPool::new(),
            rate_limiter,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}
