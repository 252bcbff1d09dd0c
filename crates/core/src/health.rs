use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a single gateway as last observed by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub gateway_id: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Consecutive failed checks.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl GatewayHealth {
    #[must_use]
    pub fn healthy(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            healthy: true,
            error: None,
            checked_at: Utc::now(),
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub fn unhealthy(gateway_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            healthy: false,
            error: Some(error.into()),
            checked_at: Utc::now(),
            consecutive_failures: 1,
        }
    }
}

/// Aggregate health surface returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub providers: Vec<GatewayHealth>,
    /// System-level problems not attributable to one gateway.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl HealthReport {
    /// Build a report from per-gateway health; healthy iff every gateway
    /// is healthy and there are no system errors.
    #[must_use]
    pub fn from_providers(providers: Vec<GatewayHealth>, errors: Vec<String>) -> Self {
        let healthy = errors.is_empty() && providers.iter().all(|p| p.healthy);
        Self {
            healthy,
            providers,
            errors,
        }
    }
}

/// One hour's send volume, for the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBucket {
    /// Start of the hour (UTC).
    pub hour: DateTime<Utc>,
    pub sent: u64,
    pub failed: u64,
}

/// Per-gateway contribution to the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub gateway_id: String,
    pub kind: String,
    pub sent: u64,
    pub failed: u64,
    pub healthy: bool,
}

/// Aggregate queue/delivery statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub total_messages: u64,
    pub messages_queued: u64,
    pub messages_processing: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub messages_today: u64,
    /// `sent / (sent + failed)` over all time; 1.0 when nothing terminal.
    pub success_rate: f64,
    #[serde(default)]
    pub hourly_stats: Vec<HourlyBucket>,
    #[serde(default)]
    pub provider_stats: Vec<ProviderStats>,
}
