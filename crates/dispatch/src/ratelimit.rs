use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use courier_core::{
    GlobalRateLimits, LimitScope, RateLimitConfig, RateLimitDecision, RateLimitSnapshot,
    normalize_email, seconds_until_next_hour, seconds_until_utc_midnight,
};
use courier_store::SentCounts;

/// Advisory wait when the burst budget is exhausted.
const BURST_RETRY_SECONDS: u64 = 60;

/// A pruned list of send timestamps; the count inside the window is the
/// current usage.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.timestamps.front().is_some_and(|t| *t < cutoff) {
            self.timestamps.pop_front();
        }
    }

    fn count(&self) -> u64 {
        self.timestamps.len() as u64
    }

    fn record(&mut self, at: DateTime<Utc>) {
        self.timestamps.push_back(at);
    }

    /// Replay `count` sends at `at`, bounded by `cap` total entries.
    fn replay(&mut self, count: u64, at: DateTime<Utc>, cap: u64) {
        let room = cap.saturating_sub(self.count());
        for _ in 0..count.min(room) {
            self.timestamps.push_back(at);
        }
    }
}

#[derive(Debug, Default)]
struct WindowPair {
    daily: SlidingWindow,
    hourly: SlidingWindow,
}

impl WindowPair {
    fn prune(&mut self, now: DateTime<Utc>) {
        self.daily.prune(now - Duration::hours(24));
        self.hourly.prune(now - Duration::hours(1));
    }

    fn record(&mut self, at: DateTime<Utc>) {
        self.daily.record(at);
        self.hourly.record(at);
    }
}

#[derive(Debug, Default)]
struct UserCounter {
    windows: WindowPair,
    burst_tokens: u64,
    burst_day: Option<NaiveDate>,
}

impl UserCounter {
    /// Refill the burst budget at the UTC-midnight rollover.
    fn refill_burst(&mut self, burst_limit: u64, today: NaiveDate) {
        if self.burst_day != Some(today) {
            self.burst_tokens = burst_limit;
            self.burst_day = Some(today);
        }
    }
}

/// Hierarchical sliding-window rate limiter: system → gateway →
/// per-sender, first denial short-circuits.
///
/// Counters live in memory and are reconciled from the queue at boot via
/// [`warm_start`](RateLimiter::warm_start); the database remains the
/// system of record. Locks are held only for counter arithmetic, never
/// across I/O.
pub struct RateLimiter {
    globals: GlobalRateLimits,
    configs: RwLock<HashMap<String, RateLimitConfig>>,
    system: Mutex<WindowPair>,
    gateways: RwLock<HashMap<String, Arc<Mutex<WindowPair>>>>,
    users: RwLock<HashMap<(String, String), Arc<Mutex<UserCounter>>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(globals: GlobalRateLimits) -> Self {
        Self {
            globals,
            configs: RwLock::new(HashMap::new()),
            system: Mutex::new(WindowPair::default()),
            gateways: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Install (or replace) a gateway's rate limit configuration.
    pub fn set_config(&self, gateway_id: impl Into<String>, config: RateLimitConfig) {
        self.configs.write().insert(gateway_id.into(), config);
    }

    fn config_for(&self, gateway_id: &str) -> RateLimitConfig {
        self.configs
            .read()
            .get(gateway_id)
            .cloned()
            .unwrap_or_default()
    }

    fn gateway_counter(&self, gateway_id: &str) -> Arc<Mutex<WindowPair>> {
        if let Some(counter) = self.gateways.read().get(gateway_id) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.gateways
                .write()
                .entry(gateway_id.to_owned())
                .or_default(),
        )
    }

    fn user_counter(&self, gateway_id: &str, sender: &str) -> Arc<Mutex<UserCounter>> {
        let key = (gateway_id.to_owned(), sender.to_owned());
        if let Some(counter) = self.users.read().get(&key) {
            return Arc::clone(counter);
        }
        Arc::clone(self.users.write().entry(key).or_default())
    }

    /// Current 24h send count for a gateway (router capacity scoring).
    #[must_use]
    pub fn gateway_daily_count(&self, gateway_id: &str) -> u64 {
        let counter = self.gateway_counter(gateway_id);
        let mut counter = counter.lock();
        counter.prune(Utc::now());
        counter.daily.count()
    }

    /// Hierarchical admission check. Does not consume budget; call
    /// [`record_send`](RateLimiter::record_send) after a successful send.
    #[must_use]
    pub fn check(&self, gateway_id: &str, sender: &str) -> RateLimitDecision {
        let now = Utc::now();
        let sender = normalize_email(sender);

        // System level.
        {
            let mut system = self.system.lock();
            system.prune(now);
            if system.daily.count() >= self.globals.system_daily {
                return RateLimitDecision::denied(
                    LimitScope::SystemDaily,
                    seconds_until_utc_midnight(now),
                );
            }
            if system.hourly.count() >= self.globals.system_hourly {
                return RateLimitDecision::denied(
                    LimitScope::SystemHourly,
                    seconds_until_next_hour(now),
                );
            }
        }

        let config = self.config_for(gateway_id);

        // Gateway level.
        if let Some(limit) = config.workspace_daily {
            let counter = self.gateway_counter(gateway_id);
            let mut counter = counter.lock();
            counter.prune(now);
            if counter.daily.count() >= limit {
                return RateLimitDecision::denied(
                    LimitScope::GatewayDaily,
                    seconds_until_utc_midnight(now),
                );
            }
        }

        // Per-sender level.
        let daily_limit = config.effective_user_daily(&sender, &self.globals);
        let counter = self.user_counter(gateway_id, &sender);
        let mut counter = counter.lock();
        counter.windows.prune(now);

        let daily_count = counter.windows.daily.count();
        if daily_count >= daily_limit {
            return RateLimitDecision::denied(
                LimitScope::UserDaily,
                seconds_until_utc_midnight(now),
            );
        }

        let hourly_count = counter.windows.hourly.count();
        if let Some(hourly_limit) = config.per_user_hourly
            && hourly_count >= hourly_limit
        {
            return RateLimitDecision::denied(
                LimitScope::UserHourly,
                seconds_until_next_hour(now),
            );
        }

        if let Some(burst_limit) = config.burst_limit
            && burst_limit > 0
        {
            counter.refill_burst(burst_limit, now.date_naive());
            if counter.burst_tokens == 0 {
                return RateLimitDecision::denied(LimitScope::Burst, BURST_RETRY_SECONDS);
            }
        }

        let remaining_daily = daily_limit.saturating_sub(daily_count);
        let remaining_hourly = config
            .per_user_hourly
            .map_or(remaining_daily, |l| l.saturating_sub(hourly_count));
        RateLimitDecision::allowed(remaining_daily, remaining_hourly)
    }

    /// Record a successful send against every level of the hierarchy and
    /// consume a burst token where burst accounting is on.
    pub fn record_send(&self, gateway_id: &str, sender: &str) {
        let now = Utc::now();
        let sender = normalize_email(sender);
        let config = self.config_for(gateway_id);

        self.system.lock().record(now);
        self.gateway_counter(gateway_id).lock().record(now);

        let counter = self.user_counter(gateway_id, &sender);
        let mut counter = counter.lock();
        counter.windows.record(now);
        if let Some(burst_limit) = config.burst_limit
            && burst_limit > 0
        {
            counter.refill_burst(burst_limit, now.date_naive());
            counter.burst_tokens = counter.burst_tokens.saturating_sub(1);
        }
        debug!(gateway = gateway_id, sender = %sender, "recorded send");
    }

    /// Reconcile counters from durable 24h aggregates at boot. Each
    /// aggregate is replayed as `count` timestamps at now into the daily
    /// windows, capped at twice the relevant limit to bound memory.
    pub fn warm_start(&self, counts: &SentCounts) {
        let now = Utc::now();
        let mut total: u64 = 0;

        for (gateway_id, senders) in counts {
            let config = self.config_for(gateway_id);
            let gateway_limit = config.workspace_daily.unwrap_or(self.globals.system_daily);
            let mut gateway_total: u64 = 0;

            for (sender, count) in senders {
                let sender = normalize_email(sender);
                let user_limit = config.effective_user_daily(&sender, &self.globals);
                let counter = self.user_counter(gateway_id, &sender);
                counter
                    .lock()
                    .windows
                    .daily
                    .replay(*count, now, user_limit.saturating_mul(2));
                gateway_total += count;
            }

            self.gateway_counter(gateway_id).lock().daily.replay(
                gateway_total,
                now,
                gateway_limit.saturating_mul(2),
            );
            total += gateway_total;
        }

        self.system
            .lock()
            .daily
            .replay(total, now, self.globals.system_daily.saturating_mul(2));
        info!(replayed = total, "rate limiter warm start complete");
    }

    /// Point-in-time view of every live counter, for the stats surface.
    #[must_use]
    pub fn snapshots(&self) -> Vec<RateLimitSnapshot> {
        let now = Utc::now();
        let mut out = Vec::new();

        for (gateway_id, counter) in self.gateways.read().iter() {
            let config = self.config_for(gateway_id);
            let mut counter = counter.lock();
            counter.prune(now);
            out.push(RateLimitSnapshot {
                gateway_id: gateway_id.clone(),
                sender: None,
                daily_count: counter.daily.count(),
                daily_limit: config.workspace_daily.unwrap_or(self.globals.system_daily),
                hourly_count: counter.hourly.count(),
                hourly_limit: self.globals.system_hourly,
                burst_tokens: 0,
            });
        }

        for ((gateway_id, sender), counter) in self.users.read().iter() {
            let config = self.config_for(gateway_id);
            let mut counter = counter.lock();
            counter.windows.prune(now);
            out.push(RateLimitSnapshot {
                gateway_id: gateway_id.clone(),
                sender: Some(sender.clone()),
                daily_count: counter.windows.daily.count(),
                daily_limit: config.effective_user_daily(sender, &self.globals),
                hourly_count: counter.windows.hourly.count(),
                hourly_limit: config.per_user_hourly.unwrap_or(0),
                burst_tokens: counter.burst_tokens,
            });
        }

        out.sort_by(|a, b| (&a.gateway_id, &a.sender).cmp(&(&b.gateway_id, &b.sender)));
        out
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(GlobalRateLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(config: RateLimitConfig) -> RateLimiter {
        let limiter = RateLimiter::default();
        limiter.set_config("gw1", config);
        limiter
    }

    #[test]
    fn allows_until_user_daily_cap() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(2),
            ..RateLimitConfig::default()
        });

        for _ in 0..2 {
            let decision = limiter.check("gw1", "a@x.com");
            assert!(decision.allowed);
            limiter.record_send("gw1", "a@x.com");
        }

        let denied = limiter.check("gw1", "a@x.com");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitScope::UserDaily));
        let retry = denied.retry_after_seconds.unwrap();
        assert!(retry > 0 && retry <= 24 * 3600, "retry_after within a day");
    }

    #[test]
    fn remaining_is_monotonic_non_increasing() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(5),
            ..RateLimitConfig::default()
        });

        let mut last = u64::MAX;
        for _ in 0..5 {
            let decision = limiter.check("gw1", "a@x.com");
            assert!(decision.allowed);
            assert!(decision.remaining_daily <= last);
            last = decision.remaining_daily;
            limiter.record_send("gw1", "a@x.com");
        }
        assert_eq!(last, 1);
        assert!(!limiter.check("gw1", "a@x.com").allowed);
    }

    #[test]
    fn custom_user_override_beats_per_user_daily() {
        let mut config = RateLimitConfig {
            per_user_daily: Some(1),
            ..RateLimitConfig::default()
        };
        config.custom_user_limits.insert("vip@x.com".into(), 3);
        let limiter = limiter_with(config);

        limiter.record_send("gw1", "ordinary@x.com");
        assert!(!limiter.check("gw1", "ordinary@x.com").allowed);

        for _ in 0..3 {
            assert!(limiter.check("gw1", "vip@x.com").allowed);
            limiter.record_send("gw1", "vip@x.com");
        }
        assert!(!limiter.check("gw1", "vip@x.com").allowed);
    }

    #[test]
    fn hourly_cap_denies_with_top_of_hour_hint() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(100),
            per_user_hourly: Some(1),
            ..RateLimitConfig::default()
        });

        limiter.record_send("gw1", "a@x.com");
        let denied = limiter.check("gw1", "a@x.com");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitScope::UserHourly));
        assert!(denied.retry_after_seconds.unwrap() <= 3600);
    }

    #[test]
    fn gateway_daily_cap() {
        let limiter = limiter_with(RateLimitConfig {
            workspace_daily: Some(1),
            per_user_daily: Some(100),
            ..RateLimitConfig::default()
        });

        assert!(limiter.check("gw1", "a@x.com").allowed);
        limiter.record_send("gw1", "a@x.com");
        // A different sender is still bounded by the gateway cap.
        let denied = limiter.check("gw1", "b@x.com");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitScope::GatewayDaily));
    }

    #[test]
    fn system_caps_apply_across_gateways() {
        let limiter = RateLimiter::new(GlobalRateLimits {
            system_daily: 2,
            system_hourly: 2,
            per_user_daily: 100,
        });

        limiter.record_send("gw1", "a@x.com");
        limiter.record_send("gw2", "b@y.com");
        let denied = limiter.check("gw3", "c@z.com");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitScope::SystemDaily));
    }

    #[test]
    fn burst_tokens_deplete_and_deny() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(100),
            burst_limit: Some(2),
            ..RateLimitConfig::default()
        });

        assert!(limiter.check("gw1", "a@x.com").allowed);
        limiter.record_send("gw1", "a@x.com");
        assert!(limiter.check("gw1", "a@x.com").allowed);
        limiter.record_send("gw1", "a@x.com");

        let denied = limiter.check("gw1", "a@x.com");
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(LimitScope::Burst));
        assert_eq!(denied.retry_after_seconds, Some(BURST_RETRY_SECONDS));
    }

    #[test]
    fn warm_start_preloads_counts() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(3),
            ..RateLimitConfig::default()
        });

        let mut counts: SentCounts = HashMap::new();
        counts
            .entry("gw1".into())
            .or_default()
            .insert("a@x.com".into(), 2);
        limiter.warm_start(&counts);

        let decision = limiter.check("gw1", "a@x.com");
        assert!(decision.allowed);
        assert_eq!(decision.remaining_daily, 1);
    }

    #[test]
    fn warm_start_caps_replay_at_twice_limit() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(5),
            ..RateLimitConfig::default()
        });

        let mut counts: SentCounts = HashMap::new();
        counts
            .entry("gw1".into())
            .or_default()
            .insert("a@x.com".into(), 1_000_000);
        limiter.warm_start(&counts);

        let snapshots = limiter.snapshots();
        let user = snapshots
            .iter()
            .find(|s| s.sender.as_deref() == Some("a@x.com"))
            .unwrap();
        assert_eq!(user.daily_count, 10);
    }

    #[test]
    fn sender_addresses_are_normalized() {
        let limiter = limiter_with(RateLimitConfig {
            per_user_daily: Some(1),
            ..RateLimitConfig::default()
        });
        limiter.record_send("gw1", "  A@X.com ");
        assert!(!limiter.check("gw1", "a@x.com").allowed);
    }
}
