use axum::http::{HeaderName, HeaderValue};
use clap::Parser;
use std::time::Duration;
use thiserror::Error;

use crate::rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS, RateLimitConfig};

// Startup configuration errors, all fatal
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("rate limit window must be a positive number of milliseconds")]
    InvalidWindow,

    #[error("rate limit max requests must be a positive integer")]
    InvalidMaxRequests,

    #[error("sweep interval must be a positive number of seconds")]
    InvalidSweepInterval,

    #[error("invalid CORS origin {0:?}")]
    InvalidCorsOrigin(String),

    #[error("invalid trusted client header name {0:?}")]
    InvalidHeaderName(String),
}

// CLI argument structure, every flag falls back to its env variable
#[derive(Parser, Debug, Clone)]
#[command(name = "user-api-server")]
#[command(about = "User API server with a sliding-window rate limiter")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    // Origin allowed by CORS (credentials are allowed for it)
    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_origin: String,

    // Trailing window length in milliseconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = DEFAULT_WINDOW_MS)]
    pub rate_limit_window_ms: u64,

    // Max admitted requests per client inside one window
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = DEFAULT_MAX_REQUESTS)]
    pub rate_limit_max_requests: u32,

    // Header carrying the client address set by a trusted proxy, e.g. x-forwarded-for
    #[arg(long, env = "TRUSTED_CLIENT_HEADER")]
    pub trusted_client_header: Option<String>,

    // How often idle clients are dropped from the request log
    #[arg(long, env = "RATE_LIMIT_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    // Upper bound on tracked clients, 0 means no cap
    #[arg(long, env = "RATE_LIMIT_MAX_TRACKED_CLIENTS", default_value_t = 0)]
    pub max_tracked_clients: usize,
}

/// Validated settings the server is built from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub cors_origin: HeaderValue,
    pub rate_limit: RateLimitConfig,
    pub trusted_client_header: Option<HeaderName>,
    pub sweep_interval: Duration,
}

impl Args {
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let rate_limit = RateLimitConfig {
            window_ms: self.rate_limit_window_ms,
            max_requests: self.rate_limit_max_requests,
            max_tracked_clients: self.max_tracked_clients,
        };
        rate_limit.validate()?;

        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        let cors_origin = HeaderValue::from_str(&self.cors_origin)
            .map_err(|_| ConfigError::InvalidCorsOrigin(self.cors_origin.clone()))?;

        let trusted_client_header = match self.trusted_client_header.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                    .map_err(|_| ConfigError::InvalidHeaderName(name.to_string()))?,
            ),
        };

        Ok(Settings {
            port: self.port,
            cors_origin,
            rate_limit,
            trusted_client_header,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        })
    }
}
