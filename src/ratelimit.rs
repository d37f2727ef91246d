//! Per-source rate limiting.
//!
//! Each client IP owns an independent token bucket for one-shot HTTP requests
//! and another for WebSocket upgrades, plus a counter bounding simultaneous
//! sessions. Buckets refill continuously at the configured per-minute rate
//! with a burst of one quarter of that rate. A background pruner drops buckets
//! that have refilled back to capacity, i.e. sources that went quiet.

use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate_per_sec: f64, burst: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate_per_sec).min(burst);
        self.last_refill = now;
    }

    fn allow(&mut self, rate_per_sec: f64, burst: f64, now: Instant) -> bool {
        self.refill(rate_per_sec, burst, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Outcome of an HTTP bucket check, with the numbers the response headers need.
#[derive(Debug, Clone, Copy)]
pub struct HttpDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
}

/// Rate limiter statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_http_limiters: usize,
    pub active_ws_limiters: usize,
    pub active_ws_connections: usize,
    pub unique_ips_with_ws_connections: usize,
    pub http_rate_per_minute: u32,
    pub ws_rate_per_minute: u32,
    pub max_ws_connections_per_ip: usize,
}

pub struct RateLimiter {
    http_buckets: DashMap<IpAddr, Bucket>,
    ws_buckets: DashMap<IpAddr, Bucket>,
    connections: DashMap<IpAddr, usize>,
    http_rate: f64,
    http_burst: f64,
    ws_rate: f64,
    ws_burst: f64,
    http_per_minute: u32,
    ws_per_minute: u32,
    max_conns_per_ip: usize,
}

impl RateLimiter {
    pub fn new(http_per_minute: u32, ws_per_minute: u32, max_conns_per_ip: usize) -> Self {
        Self {
            http_buckets: DashMap::new(),
            ws_buckets: DashMap::new(),
            connections: DashMap::new(),
            http_rate: f64::from(http_per_minute) / 60.0,
            http_burst: f64::from((http_per_minute / 4).max(1)),
            ws_rate: f64::from(ws_per_minute) / 60.0,
            ws_burst: f64::from((ws_per_minute / 4).max(1)),
            http_per_minute,
            ws_per_minute,
            max_conns_per_ip,
        }
    }

    /// Token-bucket check for a one-shot HTTP request from `ip`.
    pub fn check_http(&self, ip: IpAddr) -> HttpDecision {
        self.check_http_at(ip, Instant::now())
    }

    fn check_http_at(&self, ip: IpAddr, now: Instant) -> HttpDecision {
        let mut bucket = self
            .http_buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.http_burst, now));
        let allowed = bucket.allow(self.http_rate, self.http_burst, now);
        HttpDecision {
            allowed,
            limit: self.http_per_minute,
            remaining: bucket.tokens as u32,
        }
    }

    /// Token-bucket check for a WebSocket upgrade from `ip`.
    pub fn allow_ws(&self, ip: IpAddr) -> bool {
        self.allow_ws_at(ip, Instant::now())
    }

    fn allow_ws_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.ws_buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(self.ws_burst, now))
            .allow(self.ws_rate, self.ws_burst, now)
    }

    /// Claim a concurrent-session slot for `ip`. Fails once the per-IP cap
    /// is reached; a successful claim must be paired with [`release_slot`].
    ///
    /// [`release_slot`]: RateLimiter::release_slot
    pub fn acquire_slot(&self, ip: IpAddr) -> bool {
        let mut count = self.connections.entry(ip).or_insert(0);
        if *count >= self.max_conns_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back a slot claimed by [`acquire_slot`](RateLimiter::acquire_slot).
    pub fn release_slot(&self, ip: IpAddr) {
        if let Some(mut count) = self.connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.connections.remove_if(&ip, |_, count| *count == 0);
    }

    /// Drop buckets that have refilled to capacity; a full bucket means the
    /// source has been quiet for at least a full refill cycle.
    pub fn prune(&self) {
        let now = Instant::now();
        let (http_rate, http_burst) = (self.http_rate, self.http_burst);
        self.http_buckets.retain(|_, bucket| {
            bucket.refill(http_rate, http_burst, now);
            bucket.tokens < http_burst
        });
        let (ws_rate, ws_burst) = (self.ws_rate, self.ws_burst);
        self.ws_buckets.retain(|_, bucket| {
            bucket.refill(ws_rate, ws_burst, now);
            bucket.tokens < ws_burst
        });
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_http_limiters: self.http_buckets.len(),
            active_ws_limiters: self.ws_buckets.len(),
            active_ws_connections: self.connections.iter().map(|entry| *entry.value()).sum(),
            unique_ips_with_ws_connections: self.connections.len(),
            http_rate_per_minute: self.http_per_minute,
            ws_rate_per_minute: self.ws_per_minute,
            max_ws_connections_per_ip: self.max_conns_per_ip,
        }
    }
}

/// Extract the real client IP: `X-Forwarded-For` first (reverse proxies),
/// then `X-Real-IP` (nginx), then the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff
            .split(',')
            .next()
            .and_then(|first| first.trim().parse().ok())
        {
            return ip;
        }
    }
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
    {
        return ip;
    }
    peer.ip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn http_burst_is_a_quarter_of_the_rate() {
        let limiter = RateLimiter::new(8, 100, 10);
        let now = Instant::now();
        // burst of 2, so two requests pass and the third is shed
        assert!(limiter.check_http_at(ip(1), now).allowed);
        assert!(limiter.check_http_at(ip(1), now).allowed);
        let decision = limiter.check_http_at(ip(1), now);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 8);
    }

    #[test]
    fn buckets_refill_over_time() {
        let limiter = RateLimiter::new(60, 100, 10);
        let now = Instant::now();
        for _ in 0..15 {
            assert!(limiter.check_http_at(ip(2), now).allowed);
        }
        assert!(!limiter.check_http_at(ip(2), now).allowed);
        // one token per second at 60/min
        assert!(limiter.check_http_at(ip(2), now + Duration::from_secs(2)).allowed);
    }

    #[test]
    fn sources_have_independent_buckets() {
        let limiter = RateLimiter::new(4, 100, 10);
        let now = Instant::now();
        assert!(limiter.check_http_at(ip(3), now).allowed);
        assert!(!limiter.check_http_at(ip(3), now).allowed);
        assert!(limiter.check_http_at(ip(4), now).allowed);
    }

    #[test]
    fn ws_bucket_is_separate_from_http() {
        let limiter = RateLimiter::new(4, 100, 10);
        let now = Instant::now();
        assert!(limiter.check_http_at(ip(5), now).allowed);
        assert!(!limiter.check_http_at(ip(5), now).allowed);
        assert!(limiter.allow_ws_at(ip(5), now));
    }

    #[test]
    fn slot_cap_bounds_concurrent_sessions() {
        let limiter = RateLimiter::new(60, 100, 2);
        assert!(limiter.acquire_slot(ip(6)));
        assert!(limiter.acquire_slot(ip(6)));
        assert!(!limiter.acquire_slot(ip(6)));

        limiter.release_slot(ip(6));
        assert!(limiter.acquire_slot(ip(6)));
    }

    #[test]
    fn releasing_the_last_slot_forgets_the_source() {
        let limiter = RateLimiter::new(60, 100, 2);
        assert!(limiter.acquire_slot(ip(7)));
        assert_eq!(limiter.stats().unique_ips_with_ws_connections, 1);
        limiter.release_slot(ip(7));
        assert_eq!(limiter.stats().unique_ips_with_ws_connections, 0);
        // spurious release is a no-op
        limiter.release_slot(ip(7));
    }

    #[test]
    fn prune_drops_quiet_sources() {
        let limiter = RateLimiter::new(60, 100, 10);
        let now = Instant::now();
        // drain a few tokens so the bucket is below capacity
        for _ in 0..5 {
            limiter.check_http_at(ip(8), now);
        }
        limiter.prune();
        assert_eq!(limiter.stats().active_http_limiters, 1);

        // after enough wall time the bucket is back at capacity; simulate by
        // recreating the limiter state through refill in prune
        limiter
            .http_buckets
            .get_mut(&ip(8))
            .unwrap()
            .refill(limiter.http_rate, limiter.http_burst, now + Duration::from_secs(3600));
        limiter.prune();
        assert_eq!(limiter.stats().active_http_limiters, 0);
    }

    #[test]
    fn stats_count_open_sessions() {
        let limiter = RateLimiter::new(60, 100, 10);
        limiter.acquire_slot(ip(9));
        limiter.acquire_slot(ip(9));
        limiter.acquire_slot(ip(10));
        let stats = limiter.stats();
        assert_eq!(stats.active_ws_connections, 3);
        assert_eq!(stats.unique_ips_with_ws_connections, 2);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.9".parse::<IpAddr>().unwrap());

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_ip(&headers, peer), "198.51.100.7".parse::<IpAddr>().unwrap());

        assert_eq!(client_ip(&HeaderMap::new(), peer), peer.ip());
    }

    #[test]
    fn garbage_forwarded_header_falls_back_to_peer() {
        let peer: SocketAddr = "192.0.2.4:80".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, peer), peer.ip());
    }
}
