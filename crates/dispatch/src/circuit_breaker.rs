use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DispatchError;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation — sends flow through.
    Closed,
    /// Gateway is failing — sends are rejected immediately.
    Open,
    /// Recovery probing — a bounded number of sends is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a per-gateway circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing.
    pub success_threshold: u32,
    /// How long to stay open before probing.
    pub timeout: Duration,
    /// Probe budget per half-open episode.
    pub max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            max_requests: 1,
        }
    }
}

impl BreakerConfig {
    /// Reject unusable threshold values. `timeout = 0` is allowed (useful
    /// in tests).
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold < 1 {
            return Err("failure_threshold must be >= 1".into());
        }
        if self.success_threshold < 1 {
            return Err("success_threshold must be >= 1".into());
        }
        if self.max_requests < 1 {
            return Err("max_requests must be >= 1".into());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerData {
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    half_open_permits: u32,
    trips: u64,
}

impl Default for BreakerData {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure: None,
            half_open_permits: 0,
            trips: 0,
        }
    }
}

/// Point-in-time view of one breaker, for the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub gateway_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// Times the breaker opened since boot.
    pub trips: u64,
}

/// Fault isolation around one gateway's send path.
///
/// Transitions are brief mutations under a mutex and never overlap the
/// send I/O itself: the caller acquires a permit, performs the send, then
/// reports the outcome.
pub struct CircuitBreaker {
    gateway_id: String,
    config: BreakerConfig,
    data: Mutex<BreakerData>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(gateway_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            config,
            data: Mutex::new(BreakerData::default()),
        }
    }

    /// Acquire permission to send. In `Open` state this fails fast until
    /// the timeout elapses, then flips to `HalfOpen` with a bounded probe
    /// budget.
    pub fn try_acquire(&self) -> Result<(), DispatchError> {
        let mut data = self.data.lock();
        match data.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed_ok = data.opened_at.is_none_or(|t| {
                    (Utc::now() - t).to_std().unwrap_or_default() >= self.config.timeout
                });
                if elapsed_ok {
                    debug!(gateway = %self.gateway_id, "circuit breaker half-open, probing");
                    data.state = CircuitState::HalfOpen;
                    data.consecutive_successes = 0;
                    data.half_open_permits = self.config.max_requests.saturating_sub(1);
                    Ok(())
                } else {
                    Err(DispatchError::CircuitOpen {
                        gateway: self.gateway_id.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if data.half_open_permits > 0 {
                    data.half_open_permits -= 1;
                    Ok(())
                } else {
                    Err(DispatchError::CircuitOpen {
                        gateway: self.gateway_id.clone(),
                    })
                }
            }
        }
    }

    /// Report a successful send.
    pub fn record_success(&self) {
        let mut data = self.data.lock();
        match data.state {
            CircuitState::Closed => {
                data.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                data.consecutive_successes += 1;
                if data.consecutive_successes >= self.config.success_threshold {
                    info!(gateway = %self.gateway_id, "circuit breaker closing after successful probes");
                    data.state = CircuitState::Closed;
                    data.failure_count = 0;
                    data.consecutive_successes = 0;
                    data.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Report a failed send.
    pub fn record_failure(&self) {
        let mut data = self.data.lock();
        let now = Utc::now();
        data.last_failure = Some(now);
        match data.state {
            CircuitState::Closed => {
                data.failure_count += 1;
                if data.failure_count >= self.config.failure_threshold {
                    info!(
                        gateway = %self.gateway_id,
                        failures = data.failure_count,
                        "circuit breaker opening"
                    );
                    data.state = CircuitState::Open;
                    data.opened_at = Some(now);
                    data.trips += 1;
                }
            }
            CircuitState::HalfOpen => {
                info!(gateway = %self.gateway_id, "circuit breaker re-opening after probe failure");
                data.state = CircuitState::Open;
                data.opened_at = Some(now);
                data.consecutive_successes = 0;
                data.trips += 1;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, without triggering transitions.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Whether sends are currently rejected outright.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let data = self.data.lock();
        data.state == CircuitState::Open
            && data.opened_at.is_some_and(|t| {
                (Utc::now() - t).to_std().unwrap_or_default() < self.config.timeout
            })
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let data = self.data.lock();
        BreakerSnapshot {
            gateway_id: self.gateway_id.clone(),
            state: data.state,
            failure_count: data.failure_count,
            last_failure: data.last_failure,
            trips: data.trips,
        }
    }
}

/// All breakers, keyed by gateway id; created on first use.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get (or lazily create) the breaker for a gateway.
    #[must_use]
    pub fn breaker(&self, gateway_id: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            &self
                .breakers
                .entry(gateway_id.to_owned())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(gateway_id, self.config.clone()))
                }),
        )
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> =
            self.breakers.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.gateway_id.cmp(&b.gateway_id));
        out
    }
}
