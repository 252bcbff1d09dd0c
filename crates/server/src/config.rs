use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::GlobalRateLimits;
use courier_dispatch::{BreakerConfig, ProcessorConfig};

/// Top-level TOML configuration (`courier.toml`). Every section has
/// working defaults; secrets prefer `COURIER_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub rate_limits: RateLimitSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub tracking: TrackingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8085
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Storage backend selection. `memory` serves local development and
/// tests; production runs on `postgres`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Connection string; `COURIER_DATABASE_URL` overrides.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_seconds: u64,
}

fn default_backend() -> String {
    "postgres".to_owned()
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    5
}

fn default_max_lifetime() -> u64 {
    300
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_lifetime_seconds: default_max_lifetime(),
        }
    }
}

impl DatabaseSection {
    /// Resolve the connection string: env var first, then the file.
    #[must_use]
    pub fn resolve_url(&self) -> Option<String> {
        std::env::var("COURIER_DATABASE_URL")
            .ok()
            .or_else(|| self.url.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_tick_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
}

fn default_tick_seconds() -> u64 {
    5
}

fn default_batch_size() -> usize {
    10
}

fn default_max_workers() -> usize {
    4
}

fn default_send_timeout() -> u64 {
    30
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_seconds(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            send_timeout_seconds: default_send_timeout(),
        }
    }
}

impl DispatchSection {
    #[must_use]
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            tick_interval: Duration::from_secs(self.tick_interval_seconds),
            batch_size: self.batch_size,
            max_workers: self.max_workers,
            send_timeout: Duration::from_secs(self.send_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_system_daily")]
    pub system_daily: u64,
    #[serde(default = "default_system_hourly")]
    pub system_hourly: u64,
    #[serde(default = "default_per_user_daily")]
    pub per_user_daily: u64,
}

fn default_system_daily() -> u64 {
    100_000
}

fn default_system_hourly() -> u64 {
    10_000
}

fn default_per_user_daily() -> u64 {
    500
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            system_daily: default_system_daily(),
            system_hourly: default_system_hourly(),
            per_user_daily: default_per_user_daily(),
        }
    }
}

impl RateLimitSection {
    #[must_use]
    pub fn globals(&self) -> GlobalRateLimits {
        GlobalRateLimits {
            system_daily: self.system_daily,
            system_hourly: self.system_hourly,
            per_user_daily: self.per_user_daily,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_max_requests() -> u32 {
    1
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_breaker_timeout(),
            max_requests: default_max_requests(),
        }
    }
}

impl BreakerSection {
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_seconds),
            max_requests: self.max_requests,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
}

fn default_health_interval() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    10
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval(),
            timeout_seconds: default_health_timeout(),
        }
    }
}

/// Tracking URL injection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingSection {
    /// Public base URL of this server, for pixel/click/unsubscribe links.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: CourierConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8085);
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.rate_limits.system_daily, 100_000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.database.backend, "postgres");
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: CourierConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [dispatch]
            tick_interval_seconds = 2

            [database]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.dispatch.tick_interval_seconds, 2);
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.database.backend, "memory");
    }

    #[test]
    fn sections_convert_to_runtime_configs() {
        let config = CourierConfig::default();
        let processor = config.dispatch.processor_config();
        assert_eq!(processor.tick_interval, Duration::from_secs(5));
        assert_eq!(processor.send_timeout, Duration::from_secs(30));
        let breaker = config.breaker.breaker_config();
        assert_eq!(breaker.timeout, Duration::from_secs(60));
        let globals = config.rate_limits.globals();
        assert_eq!(globals.per_user_daily, 500);
    }
}
