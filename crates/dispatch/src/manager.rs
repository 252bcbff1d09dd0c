use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use courier_core::{GatewayHealth, GlobalRateLimits, HealthReport, LoadBalancingPool};
use courier_gateway::DynGateway;

use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry};
use crate::error::DispatchError;
use crate::ratelimit::RateLimiter;
use crate::router::{RouteCandidate, Router};

/// Owns the registered gateways and the reliability machinery around
/// them: router, rate limiter, circuit breakers, and the latest health
/// observations. The router receives candidate views built here and never
/// calls back into the manager.
pub struct GatewayManager {
    gateways: RwLock<HashMap<String, Arc<dyn DynGateway>>>,
    router: Router,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: RwLock<HashMap<String, GatewayHealth>>,
}

impl GatewayManager {
    #[must_use]
    pub fn new(globals: GlobalRateLimits, breaker_config: BreakerConfig) -> Self {
        Self {
            gateways: RwLock::new(HashMap::new()),
            router: Router::new(),
            limiter: Arc::new(RateLimiter::new(globals)),
            breakers: Arc::new(CircuitBreakerRegistry::new(breaker_config)),
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Register a gateway and install its rate limit configuration.
    pub fn register(&self, gateway: Arc<dyn DynGateway>) {
        let id = gateway.id().to_owned();
        self.limiter
            .set_config(&id, gateway.config().rate_limits.clone());
        info!(gateway = %id, kind = %gateway.kind(), "registered gateway");
        self.gateways.write().insert(id, gateway);
    }

    /// Replace the load-balancing pool set.
    pub fn set_pools(&self, pools: Vec<LoadBalancingPool>) {
        self.router.set_pools(pools);
    }

    /// Record a health observation for a gateway.
    pub fn set_health(&self, health: GatewayHealth) {
        self.health
            .write()
            .insert(health.gateway_id.clone(), health);
    }

    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    #[must_use]
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Fetch one registered gateway.
    #[must_use]
    pub fn gateway(&self, id: &str) -> Option<Arc<dyn DynGateway>> {
        self.gateways.read().get(id).cloned()
    }

    /// All registered gateways.
    #[must_use]
    pub fn all_gateways(&self) -> Vec<Arc<dyn DynGateway>> {
        self.gateways.read().values().cloned().collect()
    }

    /// Build the router's candidate views from live signals.
    fn candidates(&self) -> Vec<RouteCandidate> {
        let health = self.health.read();
        let mut out: Vec<RouteCandidate> = self
            .gateways
            .read()
            .values()
            .map(|gw| {
                let config = gw.config().clone();
                let healthy = health
                    .get(&config.id)
                    .is_none_or(|h| h.healthy);
                let circuit_open = self.breakers.breaker(&config.id).is_open();
                let daily_sent = self.limiter.gateway_daily_count(&config.id);
                let daily_limit = config.rate_limits.workspace_daily.unwrap_or(0);
                RouteCandidate {
                    config,
                    healthy,
                    circuit_open,
                    daily_sent,
                    daily_limit,
                }
            })
            .collect();
        out.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        out
    }

    /// Route a sender to a concrete gateway.
    pub fn select_gateway(&self, sender: &str) -> Result<Arc<dyn DynGateway>, DispatchError> {
        let id = self.router.select(sender, &self.candidates())?;
        self.gateway(&id)
            .ok_or_else(|| DispatchError::Routing(format!("selected gateway {id} disappeared")))
    }

    /// The ordered failover peers for a gateway, already health-gated.
    #[must_use]
    pub fn failover_chain(&self, gateway_id: &str, sender: &str) -> Vec<Arc<dyn DynGateway>> {
        let Some(primary) = self.gateway(gateway_id) else {
            return Vec::new();
        };
        self.router
            .failover_candidates(primary.config(), sender, &self.candidates())
            .into_iter()
            .filter_map(|id| self.gateway(&id))
            .collect()
    }

    /// Aggregate health surface from the latest observations.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        let health = self.health.read();
        let providers = self
            .gateways
            .read()
            .values()
            .map(|gw| {
                health
                    .get(gw.id())
                    .cloned()
                    .unwrap_or_else(|| GatewayHealth::healthy(gw.id()))
            })
            .collect();
        HealthReport::from_providers(providers, Vec::new())
    }

    /// Circuit breaker snapshots for the stats surface.
    #[must_use]
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use courier_core::{GatewayConfig, GatewayCredentials, GatewayKind, Message};
    use courier_gateway::{SendError, SendReceipt};

    use super::*;

    struct StubGateway {
        config: GatewayConfig,
    }

    impl StubGateway {
        fn new(id: &str, domain: &str) -> Arc<Self> {
            Arc::new(Self {
                config: GatewayConfig::new(
                    id,
                    domain,
                    GatewayCredentials::Mailgun {
                        api_key: "k".into(),
                        base_url: "https://api.mailgun.net/v3".into(),
                    },
                ),
            })
        }
    }

    #[async_trait]
    impl DynGateway for StubGateway {
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
            Ok(())
        }
    }

    fn manager() -> GatewayManager {
        GatewayManager::new(GlobalRateLimits::default(), BreakerConfig::default())
    }

    #[test]
    fn routes_to_registered_gateway() {
        let mgr = manager();
        mgr.register(StubGateway::new("mg1", "mail.example.com"));
        let gw = mgr.select_gateway("a@mail.example.com").unwrap();
        assert_eq!(gw.id(), "mg1");
    }

    #[test]
    fn unknown_domain_is_routing_error() {
        let mgr = manager();
        mgr.register(StubGateway::new("mg1", "mail.example.com"));
        assert!(matches!(
            mgr.select_gateway("a@stranger.org"),
            Err(DispatchError::Routing(_))
        ));
    }

    #[test]
    fn unhealthy_gateway_is_gated() {
        let mgr = manager();
        mgr.register(StubGateway::new("mg1", "mail.example.com"));
        mgr.set_health(GatewayHealth::unhealthy("mg1", "boom"));
        assert!(mgr.select_gateway("a@mail.example.com").is_err());

        mgr.set_health(GatewayHealth::healthy("mg1"));
        assert!(mgr.select_gateway("a@mail.example.com").is_ok());
    }

    #[test]
    fn sole_gateway_with_open_breaker_is_still_routable() {
        let mgr = manager();
        mgr.register(StubGateway::new("mg1", "mail.example.com"));
        let breaker = mgr.breakers().breaker("mg1");
        for _ in 0..5 {
            breaker.record_failure();
        }
        // Routing still resolves; the breaker fails the send fast so the
        // processor can defer and eventually probe.
        let gw = mgr.select_gateway("a@mail.example.com").unwrap();
        assert_eq!(gw.id(), "mg1");
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn failover_chain_follows_config_order() {
        let mgr = manager();
        let mut primary = StubGateway::new("primary", "mail.example.com");
        Arc::get_mut(&mut primary).unwrap().config.failover_to =
            vec!["second".into(), "third".into()];
        mgr.register(primary);
        mgr.register(StubGateway::new("second", "b.com"));
        mgr.register(StubGateway::new("third", "c.com"));

        let chain = mgr.failover_chain("primary", "a@mail.example.com");
        let ids: Vec<&str> = chain.iter().map(|g| g.id()).collect();
        assert_eq!(ids, vec!["second", "third"]);
    }

    #[test]
    fn health_report_defaults_to_healthy() {
        let mgr = manager();
        mgr.register(StubGateway::new("mg1", "mail.example.com"));
        let report = mgr.health_report();
        assert!(report.healthy);
        assert_eq!(report.providers.len(), 1);
    }
}
