//! Process configuration.
//!
//! Resolution order: CLI flag → environment variable → default. The CLI
//! layer handles the first two; these structs carry the resolved values and
//! provide env-based construction for library users.
//!
//! Environment variables:
//!
//! | Variable | Component | Default |
//! |---|---|---|
//! | `REDIS_ADDR` | both | `redis:6379` |
//! | `API_PORT` | api | `8080` |
//! | `CORS_ALLOW_ORIGIN` | api | `*` |
//! | `ENGINE_ADDR` | worker | `stockfish:4000` |
//! | `METRICS_PORT` | worker | `9090` |
//! | `K8S_NAMESPACE` | worker | `stockfish` |

use std::time::Duration;

/// Front-end configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Queue endpoint, `host:port` or a full `redis://` URL.
    pub redis_addr: String,
    /// Value for `Access-Control-Allow-Origin`.
    pub cors_allow_origin: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_addr: "redis:6379".to_string(),
            cors_allow_origin: "*".to_string(),
        }
    }
}

impl ApiConfig {
    /// Builds the configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parsed("API_PORT", defaults.port),
            redis_addr: env_or("REDIS_ADDR", &defaults.redis_addr),
            cors_allow_origin: env_or("CORS_ALLOW_ORIGIN", &defaults.cors_allow_origin),
        }
    }

    /// Sets the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the queue endpoint.
    pub fn with_redis_addr(mut self, addr: impl Into<String>) -> Self {
        self.redis_addr = addr.into();
        self
    }

    /// Sets the CORS allow-origin value.
    pub fn with_cors_allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_allow_origin = origin.into();
        self
    }

    /// Queue endpoint as a `redis://` URL.
    pub fn redis_url(&self) -> String {
        redis_url(&self.redis_addr)
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue endpoint, `host:port` or a full `redis://` URL.
    pub redis_addr: String,
    /// Engine endpoint, `host:port`.
    pub engine_addr: String,
    /// Port for `/healthz` and `/metrics`.
    pub metrics_port: u16,
    /// Blocking-pop timeout for the main loop.
    pub pop_timeout: Duration,
    /// Budget for draining active jobs on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_addr: "redis:6379".to_string(),
            engine_addr: "stockfish:4000".to_string(),
            metrics_port: 9090,
            pop_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Builds the configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_addr: env_or("REDIS_ADDR", &defaults.redis_addr),
            engine_addr: env_or("ENGINE_ADDR", &defaults.engine_addr),
            metrics_port: env_parsed("METRICS_PORT", defaults.metrics_port),
            ..defaults
        }
    }

    /// Sets the queue endpoint.
    pub fn with_redis_addr(mut self, addr: impl Into<String>) -> Self {
        self.redis_addr = addr.into();
        self
    }

    /// Sets the engine endpoint.
    pub fn with_engine_addr(mut self, addr: impl Into<String>) -> Self {
        self.engine_addr = addr.into();
        self
    }

    /// Sets the observability port.
    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = port;
        self
    }

    /// Sets the blocking-pop timeout.
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    /// Sets the shutdown drain budget.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Queue endpoint as a `redis://` URL.
    pub fn redis_url(&self) -> String {
        redis_url(&self.redis_addr)
    }
}

/// Normalises a queue endpoint to a `redis://` URL. Plain `host:port`
/// values get the scheme prepended; anything with a scheme passes through.
pub fn redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}", addr)
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.redis_addr, "redis:6379");
        assert_eq!(config.cors_allow_origin, "*");
    }

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.engine_addr, "stockfish:4000");
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.pop_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_builders() {
        let config = WorkerConfig::default()
            .with_redis_addr("localhost:6380")
            .with_engine_addr("localhost:4001")
            .with_metrics_port(9100)
            .with_pop_timeout(Duration::from_secs(1));

        assert_eq!(config.redis_addr, "localhost:6380");
        assert_eq!(config.engine_addr, "localhost:4001");
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.pop_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_redis_url_normalisation() {
        assert_eq!(redis_url("redis:6379"), "redis://redis:6379");
        assert_eq!(redis_url("redis://host:6379"), "redis://host:6379");
        assert_eq!(
            redis_url("rediss://secure-host:6380"),
            "rediss://secure-host:6380"
        );
    }
}
