use serde::{Deserialize, Serialize};

/// Member-selection strategy for a load-balancing pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Advance a pool-local cursor across enabled members.
    RoundRobin,
    /// Pick the member with the lowest rolling 24h send count.
    LeastUsed,
    /// Score members by `remaining_capacity / daily_limit`, highest wins.
    CapacityWeighted,
    /// Draw proportional to member weight.
    RandomWeighted,
}

impl PoolStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastUsed => "least_used",
            Self::CapacityWeighted => "capacity_weighted",
            Self::RandomWeighted => "random_weighted",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "round_robin" => Some(Self::RoundRobin),
            "least_used" => Some(Self::LeastUsed),
            "capacity_weighted" => Some(Self::CapacityWeighted),
            "random_weighted" => Some(Self::RandomWeighted),
            _ => None,
        }
    }
}

impl std::fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gateway's membership in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMember {
    pub gateway_id: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl PoolMember {
    #[must_use]
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            weight: 1,
            priority: 0,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// A named group of gateways with a selection strategy, optionally bound
/// to sender-domain patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingPool {
    pub id: String,
    pub name: String,
    pub strategy: PoolStrategy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Pool used when no domain pattern and no direct gateway matches.
    #[serde(default)]
    pub is_default: bool,
    /// Sender-domain patterns this pool serves: a literal domain or a
    /// `*.suffix` wildcard.
    #[serde(default)]
    pub domain_patterns: Vec<String>,
    /// Ordered members.
    #[serde(default)]
    pub members: Vec<PoolMember>,
}

impl LoadBalancingPool {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, strategy: PoolStrategy) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            strategy,
            enabled: true,
            is_default: false,
            domain_patterns: Vec::new(),
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_domain_patterns(mut self, patterns: Vec<String>) -> Self {
        self.domain_patterns = patterns;
        self
    }

    #[must_use]
    pub fn with_members(mut self, members: Vec<PoolMember>) -> Self {
        self.members = members;
        self
    }

    #[must_use]
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Whether any of the pool's domain patterns match the sender domain.
    #[must_use]
    pub fn matches_domain(&self, sender_domain: &str) -> bool {
        let domain = sender_domain.to_ascii_lowercase();
        self.domain_patterns
            .iter()
            .any(|p| domain_pattern_matches(p, &domain))
    }

    /// Enabled members, in declaration order.
    pub fn enabled_members(&self) -> impl Iterator<Item = &PoolMember> {
        self.members.iter().filter(|m| m.enabled)
    }
}

/// Match a sender domain against a pool pattern. Patterns are either a
/// literal domain or a `*.suffix` wildcard; a wildcard matches the bare
/// suffix and any subdomain of it.
#[must_use]
pub fn domain_pattern_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        domain == suffix || domain.ends_with(&format!(".{suffix}"))
    } else {
        domain == pattern
    }
}
