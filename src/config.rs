//! Environment-driven configuration.

use std::env;
use std::time::Duration;
use thiserror::Error;

const MIN_SECRET_LEN: usize = 8;

/// Deployment environment, gating the stricter production checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

/// Fatal configuration problems; the process refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment '{0}' (expected development, staging or production)")]
    InvalidEnvironment(String),
    #[error("SESSION_SECRET must be at least {MIN_SECRET_LEN} bytes")]
    SecretTooShort,
    #[error("SESSION_SECRET is required in production")]
    MissingSecret,
    #[error("ALLOWED_ORIGINS is required in production")]
    MissingOrigins,
    #[error("wildcard origins are not allowed in production")]
    WildcardOrigin,
}

/// Server configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub log_level: String,

    pub session_secret: Vec<u8>,
    pub token_ttl: Duration,
    pub allowed_origins: Vec<String>,

    #[allow(dead_code)]
    pub read_timeout: Duration,
    #[allow(dead_code)]
    pub write_timeout: Duration,
    #[allow(dead_code)]
    pub idle_timeout: Duration,
    /// Read deadline for a session: no inbound frame for this long ends it.
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Pool reaper period.
    pub cleanup_interval: Duration,
    /// Liveness cutoff beyond which the reaper removes a session.
    pub idle_cutoff: Duration,

    pub http_rate_per_minute: u32,
    pub ws_rate_per_minute: u32,
    pub max_ws_conn_per_ip: usize,

    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServerConfig>,
}

/// One TURN server entry: `url,username,credential`.
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    /// Load configuration from the environment, validating the combinations
    /// that must never reach production.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = match get_env("ENVIRONMENT", "development").as_str() {
            "development" => Environment::Development,
            "staging" => Environment::Staging,
            "production" => Environment::Production,
            other => return Err(ConfigError::InvalidEnvironment(other.to_string())),
        };

        let session_secret = match env::var("SESSION_SECRET") {
            Ok(secret) if !secret.is_empty() => {
                if secret.len() < MIN_SECRET_LEN {
                    return Err(ConfigError::SecretTooShort);
                }
                secret.into_bytes()
            }
            _ => {
                if environment == Environment::Production {
                    return Err(ConfigError::MissingSecret);
                }
                eprintln!(
                    "warning: SESSION_SECRET not set, using a generated secret; \
                     tokens will not survive a restart"
                );
                (0..64).map(|_| rand::random::<u8>()).collect()
            }
        };

        let allowed_origins = match env::var("ALLOWED_ORIGINS") {
            Ok(origins) if !origins.is_empty() => origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => {
                if environment == Environment::Production {
                    return Err(ConfigError::MissingOrigins);
                }
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:8080".to_string(),
                ]
            }
        };
        if environment == Environment::Production && allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::WildcardOrigin);
        }

        Ok(Self {
            host: get_env("HOST", "0.0.0.0"),
            port: get_parsed("PORT", 8080),
            environment,
            log_level: get_env("LOG_LEVEL", "info"),

            session_secret,
            token_ttl: get_duration("TOKEN_TTL_SECS", 24 * 60 * 60),
            allowed_origins,

            read_timeout: get_duration("READ_TIMEOUT_SECS", 15),
            write_timeout: get_duration("WRITE_TIMEOUT_SECS", 15),
            idle_timeout: get_duration("IDLE_TIMEOUT_SECS", 60),
            connection_timeout: get_duration("CONNECTION_TIMEOUT_SECS", 60),
            heartbeat_interval: get_duration("HEARTBEAT_INTERVAL_SECS", 30),
            cleanup_interval: get_duration("CLEANUP_INTERVAL_SECS", 30),
            idle_cutoff: get_duration("IDLE_CUTOFF_SECS", 300),

            http_rate_per_minute: get_parsed("HTTP_RATE_LIMIT_PER_MINUTE", 60),
            ws_rate_per_minute: get_parsed("WS_RATE_LIMIT_PER_MINUTE", 100),
            max_ws_conn_per_ip: get_parsed("MAX_WS_CONN_PER_IP", 10),

            stun_servers: get_stun_servers(),
            turn_servers: get_turn_servers(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: Environment::Development,
            log_level: "debug".to_string(),
            session_secret: b"test-secret-material".to_vec(),
            token_ttl: Duration::from_secs(24 * 60 * 60),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            idle_cutoff: Duration::from_secs(300),
            http_rate_per_minute: 600,
            ws_rate_per_minute: 600,
            max_ws_conn_per_ip: 10,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_duration(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(get_parsed(key, default_secs))
}

fn get_stun_servers() -> Vec<String> {
    let configured = get_env("STUN_SERVERS", "");
    if configured.is_empty() {
        return vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ];
    }
    configured
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `TURN_SERVERS` holds `;`-separated entries of `url,username,credential`.
fn get_turn_servers() -> Vec<TurnServerConfig> {
    let configured = get_env("TURN_SERVERS", "");
    configured
        .split(';')
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
            match parts.as_slice() {
                [url, username, credential] if !url.is_empty() => Some(TurnServerConfig {
                    url: url.to_string(),
                    username: username.to_string(),
                    credential: credential.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}
