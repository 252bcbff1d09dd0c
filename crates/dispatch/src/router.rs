use std::cmp::Reverse;
use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use courier_core::{GatewayConfig, LoadBalancingPool, PoolMember, PoolStrategy, sender_domain};

use crate::error::DispatchError;

/// A gateway as the router sees it at selection time: static
/// configuration plus the live signals that gate and score it.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub config: GatewayConfig,
    pub healthy: bool,
    pub circuit_open: bool,
    /// Rolling 24h sends through this gateway.
    pub daily_sent: u64,
    /// Effective daily capacity, for capacity scoring.
    pub daily_limit: u64,
}

impl RouteCandidate {
    /// Build a candidate with optimistic live signals (tests, warm boot).
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            healthy: true,
            circuit_open: false,
            daily_sent: 0,
            daily_limit: 0,
        }
    }

    fn available(&self, ignore_breaker: bool) -> bool {
        self.config.enabled && self.healthy && (ignore_breaker || !self.circuit_open)
    }

    fn usable_for(&self, sender: &str, ignore_breaker: bool) -> bool {
        self.available(ignore_breaker) && !self.config.excludes_sender(sender)
    }

    /// Fraction of daily capacity still unused.
    #[allow(clippy::cast_precision_loss)]
    fn remaining_score(&self) -> f64 {
        if self.daily_limit == 0 {
            return 1.0;
        }
        self.daily_limit.saturating_sub(self.daily_sent) as f64 / self.daily_limit as f64
    }
}

/// Gateway selection: pool match → direct domain match → default pool,
/// with exclusion and health gates throughout.
pub struct Router {
    pools: RwLock<Vec<LoadBalancingPool>>,
    /// Round-robin cursor per pool.
    cursors: DashMap<String, usize>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(Vec::new()),
            cursors: DashMap::new(),
        }
    }

    /// Replace the pool set (boot and config reload).
    pub fn set_pools(&self, pools: Vec<LoadBalancingPool>) {
        *self.pools.write() = pools;
    }

    /// Pick a gateway for the sender, or fail with `no_gateway_available`.
    ///
    /// Candidates with an open breaker are avoided while an alternative
    /// exists; when every usable candidate is breaker-open, the best of
    /// them is still returned so the breaker itself can fail fast (and
    /// eventually probe). Routing fails only when nothing enabled and
    /// healthy remains.
    pub fn select(
        &self,
        sender: &str,
        candidates: &[RouteCandidate],
    ) -> Result<String, DispatchError> {
        match self.select_inner(sender, candidates, false) {
            Ok(id) => Ok(id),
            Err(_) => self.select_inner(sender, candidates, true),
        }
    }

    fn select_inner(
        &self,
        sender: &str,
        candidates: &[RouteCandidate],
        ignore_breaker: bool,
    ) -> Result<String, DispatchError> {
        let domain = sender_domain(sender)
            .ok_or_else(|| DispatchError::Routing(format!("malformed sender address {sender}")))?;
        let by_id: HashMap<&str, &RouteCandidate> = candidates
            .iter()
            .map(|c| (c.config.id.as_str(), c))
            .collect();

        let pools = self.pools.read();

        // 1. First enabled pool whose patterns match the sender domain.
        if let Some(pool) = pools.iter().find(|p| p.enabled && p.matches_domain(&domain))
            && let Some(id) = self.select_from_pool(pool, sender, &domain, &by_id, ignore_breaker)
        {
            debug!(pool = %pool.id, gateway = %id, "routed via domain pool");
            return Ok(id);
        }

        // 2. Direct match on the gateway's own domain: lower priority
        //    wins, higher weight breaks ties.
        let direct = candidates
            .iter()
            .filter(|c| c.usable_for(sender, ignore_breaker) && c.config.matches_domain(&domain))
            .min_by_key(|c| (c.config.priority, Reverse(c.config.weight)));
        if let Some(chosen) = direct {
            return Ok(chosen.config.id.clone());
        }

        // 3. Default pool fallback.
        if let Some(pool) = pools.iter().find(|p| p.enabled && p.is_default)
            && let Some(id) = self.select_from_pool(pool, sender, &domain, &by_id, ignore_breaker)
        {
            debug!(pool = %pool.id, gateway = %id, "routed via default pool");
            return Ok(id);
        }

        Err(DispatchError::Routing(format!(
            "no gateway available for sender domain {domain}"
        )))
    }

    /// Ordered, health-gated failover peers for a gateway.
    #[must_use]
    pub fn failover_candidates(
        &self,
        config: &GatewayConfig,
        sender: &str,
        candidates: &[RouteCandidate],
    ) -> Vec<String> {
        let by_id: HashMap<&str, &RouteCandidate> = candidates
            .iter()
            .map(|c| (c.config.id.as_str(), c))
            .collect();
        config
            .failover_to
            .iter()
            .filter(|id| {
                by_id
                    .get(id.as_str())
                    .is_some_and(|c| c.usable_for(sender, false))
            })
            .cloned()
            .collect()
    }

    fn select_from_pool(
        &self,
        pool: &LoadBalancingPool,
        sender: &str,
        domain: &str,
        by_id: &HashMap<&str, &RouteCandidate>,
        ignore_breaker: bool,
    ) -> Option<String> {
        let members: Vec<(&PoolMember, &RouteCandidate)> = pool
            .enabled_members()
            .filter_map(|m| by_id.get(m.gateway_id.as_str()).map(|c| (m, *c)))
            .filter(|(_, c)| {
                c.usable_for(sender, ignore_breaker)
                    && (c.config.can_route || c.config.matches_domain(domain))
            })
            .collect();
        if members.is_empty() {
            return None;
        }

        let chosen = match pool.strategy {
            PoolStrategy::RoundRobin => {
                let mut cursor = self.cursors.entry(pool.id.clone()).or_insert(0);
                let idx = *cursor % members.len();
                *cursor = cursor.wrapping_add(1);
                members[idx].0
            }
            PoolStrategy::LeastUsed => {
                members
                    .iter()
                    .min_by_key(|(m, c)| (c.daily_sent, m.priority))?
                    .0
            }
            PoolStrategy::CapacityWeighted => {
                members
                    .iter()
                    .max_by(|(ma, ca), (mb, cb)| {
                        ca.remaining_score()
                            .partial_cmp(&cb.remaining_score())
                            .unwrap_or(std::cmp::Ordering::Equal)
                            // Ties break on lower priority, then higher weight.
                            .then_with(|| mb.priority.cmp(&ma.priority))
                            .then_with(|| ma.weight.cmp(&mb.weight))
                    })?
                    .0
            }
            PoolStrategy::RandomWeighted => {
                let total: u64 = members.iter().map(|(m, _)| u64::from(m.weight)).sum();
                if total == 0 {
                    members[0].0
                } else {
                    let mut draw = rand::thread_rng().gen_range(0..total);
                    let mut picked = members[0].0;
                    for &(member, _) in &members {
                        let weight = u64::from(member.weight);
                        if draw < weight {
                            picked = member;
                            break;
                        }
                        draw -= weight;
                    }
                    picked
                }
            }
        };
        Some(chosen.gateway_id.clone())
    }
}
