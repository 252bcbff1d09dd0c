use std::collections::HashMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Per-gateway rate limit configuration. Unset fields inherit from
/// [`GlobalRateLimits`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Daily cap across all senders on this gateway.
    #[serde(default)]
    pub workspace_daily: Option<u64>,
    /// Daily cap per sender.
    #[serde(default)]
    pub per_user_daily: Option<u64>,
    /// Hourly cap per sender.
    #[serde(default)]
    pub per_user_hourly: Option<u64>,
    /// Short-term token budget refilled at each daily reset. Zero or
    /// unset disables burst accounting.
    #[serde(default)]
    pub burst_limit: Option<u64>,
    /// Per-sender daily overrides keyed by normalized email address.
    #[serde(default)]
    pub custom_user_limits: HashMap<String, u64>,
}

impl RateLimitConfig {
    /// Effective daily limit for a sender: custom override, then the
    /// gateway's per-user daily, then the global default.
    #[must_use]
    pub fn effective_user_daily(&self, sender: &str, globals: &GlobalRateLimits) -> u64 {
        self.custom_user_limits
            .get(sender)
            .copied()
            .or(self.per_user_daily)
            .unwrap_or(globals.per_user_daily)
    }
}

/// System-wide defaults and aggregate caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRateLimits {
    /// Aggregate daily cap across all gateways.
    pub system_daily: u64,
    /// Aggregate hourly cap across all gateways.
    pub system_hourly: u64,
    /// Default per-sender daily cap when a gateway sets none.
    pub per_user_daily: u64,
}

impl Default for GlobalRateLimits {
    fn default() -> Self {
        Self {
            system_daily: 100_000,
            system_hourly: 10_000,
            per_user_daily: 500,
        }
    }
}

/// Which cap denied an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    SystemDaily,
    SystemHourly,
    GatewayDaily,
    UserDaily,
    UserHourly,
    Burst,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SystemDaily => "system_daily",
            Self::SystemHourly => "system_hourly",
            Self::GatewayDaily => "gateway_daily",
            Self::UserDaily => "user_daily",
            Self::UserHourly => "user_hourly",
            Self::Burst => "burst",
        };
        f.write_str(s)
    }
}

/// Outcome of a hierarchical admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Which cap denied, when not allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LimitScope>,
    /// Advisory seconds until a retry may succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Remaining sends in the sender's daily window.
    pub remaining_daily: u64,
    /// Remaining sends in the sender's hourly window.
    pub remaining_hourly: u64,
}

impl RateLimitDecision {
    #[must_use]
    pub fn allowed(remaining_daily: u64, remaining_hourly: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_seconds: None,
            remaining_daily,
            remaining_hourly,
        }
    }

    #[must_use]
    pub fn denied(scope: LimitScope, retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(scope),
            retry_after_seconds: Some(retry_after_seconds),
            remaining_daily: 0,
            remaining_hourly: 0,
        }
    }
}

/// Point-in-time view of one counter, for the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub gateway_id: String,
    /// Empty for the gateway-wide counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub daily_count: u64,
    pub daily_limit: u64,
    pub hourly_count: u64,
    pub hourly_limit: u64,
    pub burst_tokens: u64,
}

/// Seconds from `now` until the next UTC midnight.
///
/// # Panics
///
/// Never panics in practice: truncating to a whole day is infallible for
/// representable timestamps.
#[must_use]
pub fn seconds_until_utc_midnight(now: DateTime<Utc>) -> u64 {
    let midnight = now
        .duration_trunc(Duration::days(1))
        .unwrap_or(now)
        + Duration::days(1);
    (midnight - now).num_seconds().max(1).unsigned_abs()
}

/// Seconds from `now` until the next top-of-hour.
#[must_use]
pub fn seconds_until_next_hour(now: DateTime<Utc>) -> u64 {
    let next_hour = now
        .duration_trunc(Duration::hours(1))
        .unwrap_or(now)
        + Duration::hours(1);
    (next_hour - now).num_seconds().max(1).unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn effective_user_daily_prefers_custom_override() {
        let mut config = RateLimitConfig {
            per_user_daily: Some(100),
            ..RateLimitConfig::default()
        };
        config
            .custom_user_limits
            .insert("vip@example.com".into(), 5_000);
        let globals = GlobalRateLimits::default();

        assert_eq!(config.effective_user_daily("vip@example.com", &globals), 5_000);
        assert_eq!(config.effective_user_daily("joe@example.com", &globals), 100);
    }

    #[test]
    fn effective_user_daily_falls_back_to_global() {
        let config = RateLimitConfig::default();
        let globals = GlobalRateLimits::default();
        assert_eq!(config.effective_user_daily("joe@example.com", &globals), 500);
    }

    #[test]
    fn global_defaults() {
        let globals = GlobalRateLimits::default();
        assert_eq!(globals.system_daily, 100_000);
        assert_eq!(globals.system_hourly, 10_000);
    }

    #[test]
    fn until_midnight() {
        let now = at("2026-02-10T22:00:00Z");
        assert_eq!(seconds_until_utc_midnight(now), 2 * 3600);
    }

    #[test]
    fn until_next_hour() {
        let now = at("2026-02-10T14:45:30Z");
        assert_eq!(seconds_until_next_hour(now), 14 * 60 + 30);
    }

    #[test]
    fn retry_hint_never_zero() {
        let exactly_midnight = at("2026-02-10T00:00:00Z");
        assert!(seconds_until_utc_midnight(exactly_midnight) > 0);
        assert!(seconds_until_next_hour(exactly_midnight) > 0);
    }

    #[test]
    fn decision_constructors() {
        let ok = RateLimitDecision::allowed(10, 5);
        assert!(ok.allowed);
        assert!(ok.reason.is_none());

        let no = RateLimitDecision::denied(LimitScope::UserDaily, 3600);
        assert!(!no.allowed);
        assert_eq!(no.reason, Some(LimitScope::UserDaily));
        assert_eq!(no.retry_after_seconds, Some(3600));
    }

    #[test]
    fn limit_scope_labels() {
        assert_eq!(format!("{}", LimitScope::SystemDaily), "system_daily");
        assert_eq!(format!("{}", LimitScope::Burst), "burst");
    }
}
