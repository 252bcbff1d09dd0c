use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_core::GatewayHealth;
use courier_gateway::DynGateway;

use crate::manager::GatewayManager;

/// Default interval between health sweeps.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
/// Per-gateway health check timeout.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives each health observation (e.g. to persist `provider_health`
/// rows). Failures are logged, never propagated into the sweep.
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn record(&self, health: &GatewayHealth);
}

/// A sink that drops observations; the manager cache still sees them.
pub struct NoopHealthSink;

#[async_trait]
impl HealthSink for NoopHealthSink {
    async fn record(&self, _health: &GatewayHealth) {}
}

/// Background task probing every registered gateway on an interval and
/// feeding observations to the manager's health gate.
pub struct HealthMonitor {
    manager: Arc<GatewayManager>,
    sink: Arc<dyn HealthSink>,
    interval: Duration,
    timeout: Duration,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(manager: Arc<GatewayManager>) -> Self {
        Self {
            manager,
            sink: Arc::new(NoopHealthSink),
            interval: DEFAULT_HEALTH_INTERVAL,
            timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe every gateway once.
    pub async fn sweep(&self) {
        for gateway in self.manager.all_gateways() {
            let id = gateway.id().to_owned();
            let health = match tokio::time::timeout(self.timeout, gateway.health_check()).await {
                Ok(Ok(())) => GatewayHealth::healthy(&id),
                Ok(Err(e)) => {
                    warn!(gateway = %id, error = %e, "health check failed");
                    GatewayHealth::unhealthy(&id, e.to_string())
                }
                Err(_) => {
                    warn!(gateway = %id, "health check timed out");
                    GatewayHealth::unhealthy(&id, format!("timeout after {:?}", self.timeout))
                }
            };
            self.sink.record(&health).await;
            self.manager.set_health(health);
        }
        debug!("health sweep complete");
    }

    /// Run sweeps on the configured interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("health monitor stopping");
                    break;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use courier_core::{GatewayConfig, GatewayCredentials, GatewayKind, GlobalRateLimits, Message};
    use courier_gateway::{DynGateway, SendError, SendReceipt};

    use crate::circuit_breaker::BreakerConfig;

    use super::*;

    struct FlakyGateway {
        config: GatewayConfig,
        healthy: bool,
        checks: AtomicU32,
    }

    impl FlakyGateway {
        fn new(id: &str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                config: GatewayConfig::new(
                    id,
                    "example.com",
                    GatewayCredentials::Mailgun {
                        api_key: "k".into(),
                        base_url: "https://api.mailgun.net/v3".into(),
                    },
                ),
                healthy,
                checks: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DynGateway for FlakyGateway {
        fn id(&self) -> &str {
            &self.config.id
        }

        fn kind(&self) -> GatewayKind {
            GatewayKind::Mailgun
        }

        fn config(&self) -> &GatewayConfig {
            &self.config
        }

        async fn send(&self, _message: &Message) -> Result<SendReceipt, SendError> {
            Ok(SendReceipt::accepted_anonymous())
        }

        async fn health_check(&self) -> Result<(), SendError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(())
            } else {
                Err(SendError::Transient("connection refused".into()))
            }
        }
    }

    #[tokio::test]
    async fn sweep_marks_unhealthy_gateways() {
        let manager = Arc::new(GatewayManager::new(
            GlobalRateLimits::default(),
            BreakerConfig::default(),
        ));
        let good = FlakyGateway::new("good", true);
        let bad = FlakyGateway::new("bad", false);
        manager.register(good.clone());
        manager.register(bad.clone());

        HealthMonitor::new(Arc::clone(&manager)).sweep().await;

        let report = manager.health_report();
        assert!(!report.healthy);
        let bad_entry = report
            .providers
            .iter()
            .find(|p| p.gateway_id == "bad")
            .unwrap();
        assert!(!bad_entry.healthy);
        assert!(bad_entry.error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(good.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let manager = Arc::new(GatewayManager::new(
            GlobalRateLimits::default(),
            BreakerConfig::default(),
        ));
        let monitor = HealthMonitor::new(manager).with_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
