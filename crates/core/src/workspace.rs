use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitConfig;

/// Kind of outbound provider behind a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    GoogleWorkspace,
    Mailgun,
    Mandrill,
}

impl GatewayKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleWorkspace => "google_workspace",
            Self::Mailgun => "mailgun",
            Self::Mandrill => "mandrill",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google_workspace" => Some(Self::GoogleWorkspace),
            "mailgun" => Some(Self::Mailgun),
            "mandrill" => Some(Self::Mandrill),
            _ => None,
        }
    }
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific credentials, JSON-encoded at rest. The tag matches
/// [`GatewayKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayCredentials {
    GoogleWorkspace {
        /// The service-account JSON blob (client email, private key,
        /// token URI) granted domain-wide delegation.
        service_account_json: String,
    },
    Mailgun {
        api_key: String,
        /// API root, e.g. `https://api.mailgun.net/v3`.
        #[serde(default = "default_mailgun_base_url")]
        base_url: String,
    },
    Mandrill {
        api_key: String,
        #[serde(default = "default_mandrill_base_url")]
        base_url: String,
    },
}

fn default_mailgun_base_url() -> String {
    "https://api.mailgun.net/v3".to_owned()
}

fn default_mandrill_base_url() -> String {
    "https://mandrillapp.com/api/1.0".to_owned()
}

impl GatewayCredentials {
    /// The gateway kind these credentials belong to.
    #[must_use]
    pub fn kind(&self) -> GatewayKind {
        match self {
            Self::GoogleWorkspace { .. } => GatewayKind::GoogleWorkspace,
            Self::Mailgun { .. } => GatewayKind::Mailgun,
            Self::Mandrill { .. } => GatewayKind::Mandrill,
        }
    }
}

/// Tracking options applied when a gateway supports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub track_opens: bool,
    #[serde(default)]
    pub track_clicks: bool,
    #[serde(default)]
    pub track_unsubscribes: bool,
}

/// Configuration for one concrete delivery gateway (called a "workspace"
/// in the persistence layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Stable identifier referenced by pools and messages.
    pub id: String,
    pub display_name: String,
    pub kind: GatewayKind,
    /// The one sender domain this gateway is authoritative for.
    pub domain: String,
    /// Routing priority. Lower wins.
    #[serde(default)]
    pub priority: u32,
    /// Relative weight for weighted balancing.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub credentials: GatewayCredentials,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// Headers rewritten (set or replaced) on every message this gateway
    /// sends.
    #[serde(default)]
    pub header_rewrites: HashMap<String, String>,
    /// Whether this gateway may take traffic for domains other than its
    /// own (via pools or failover).
    #[serde(default = "default_enabled")]
    pub can_route: bool,
    /// Sender patterns this gateway refuses (literal address, domain, or
    /// `*.suffix`).
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Ordered gateway ids to fail over to when a send fails.
    #[serde(default)]
    pub failover_to: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl GatewayConfig {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        credentials: GatewayCredentials,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            kind: credentials.kind(),
            id,
            domain: domain.into().to_ascii_lowercase(),
            priority: 0,
            weight: 1,
            enabled: true,
            credentials,
            rate_limits: RateLimitConfig::default(),
            tracking: TrackingConfig::default(),
            header_rewrites: HashMap::new(),
            can_route: true,
            exclude_patterns: Vec::new(),
            failover_to: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, limits: RateLimitConfig) -> Self {
        self.rate_limits = limits;
        self
    }

    #[must_use]
    pub fn with_failover_to(mut self, ids: Vec<String>) -> Self {
        self.failover_to = ids;
        self
    }

    #[must_use]
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Whether this gateway's authoritative domain matches the sender's,
    /// case-insensitively.
    #[must_use]
    pub fn matches_domain(&self, sender_domain: &str) -> bool {
        self.domain.eq_ignore_ascii_case(sender_domain)
    }

    /// Whether the sender address hits any of this gateway's exclusion
    /// patterns. Patterns may be a full address, a bare domain, or a
    /// `*.suffix` wildcard.
    #[must_use]
    pub fn excludes_sender(&self, sender: &str) -> bool {
        let sender = sender.to_ascii_lowercase();
        let domain = crate::message::sender_domain(&sender).unwrap_or_default();
        self.exclude_patterns.iter().any(|p| {
            let p = p.to_ascii_lowercase();
            if let Some(suffix) = p.strip_prefix("*.") {
                domain == suffix || domain.ends_with(&format!(".{suffix}"))
            } else {
                sender == p || domain == p
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailgun_creds() -> GatewayCredentials {
        GatewayCredentials::Mailgun {
            api_key: "key-x".into(),
            base_url: default_mailgun_base_url(),
        }
    }

    #[test]
    fn kind_roundtrip() {
        for k in [
            GatewayKind::GoogleWorkspace,
            GatewayKind::Mailgun,
            GatewayKind::Mandrill,
        ] {
            assert_eq!(GatewayKind::parse(k.as_str()), Some(k));
        }
    }

    #[test]
    fn credentials_report_kind() {
        assert_eq!(mailgun_creds().kind(), GatewayKind::Mailgun);
        let g = GatewayCredentials::GoogleWorkspace {
            service_account_json: "{}".into(),
        };
        assert_eq!(g.kind(), GatewayKind::GoogleWorkspace);
    }

    #[test]
    fn config_lowercases_domain() {
        let gw = GatewayConfig::new("mg1", "Mail.Example.COM", mailgun_creds());
        assert!(gw.matches_domain("mail.example.com"));
        assert!(gw.matches_domain("MAIL.EXAMPLE.COM"));
        assert!(!gw.matches_domain("example.com"));
    }

    #[test]
    fn exclusion_patterns() {
        let gw = GatewayConfig::new("mg1", "mail.example.com", mailgun_creds())
            .with_exclude_patterns(vec![
                "blocked@example.com".into(),
                "spam.example.com".into(),
                "*.internal.example.com".into(),
            ]);
        assert!(gw.excludes_sender("blocked@example.com"));
        assert!(gw.excludes_sender("BLOCKED@EXAMPLE.COM"));
        assert!(gw.excludes_sender("anyone@spam.example.com"));
        assert!(gw.excludes_sender("a@internal.example.com"));
        assert!(gw.excludes_sender("a@dev.internal.example.com"));
        assert!(!gw.excludes_sender("ok@example.com"));
    }

    #[test]
    fn credentials_serde_tagged() {
        let creds = GatewayCredentials::Mandrill {
            api_key: "md-key".into(),
            base_url: default_mandrill_base_url(),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"kind\":\"mandrill\""));
        let back: GatewayCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), GatewayKind::Mandrill);
    }

    #[test]
    fn mailgun_base_url_defaults() {
        let creds: GatewayCredentials =
            serde_json::from_str(r#"{"kind":"mailgun","api_key":"k"}"#).unwrap();
        match creds {
            GatewayCredentials::Mailgun { base_url, .. } => {
                assert_eq!(base_url, "https://api.mailgun.net/v3");
            }
            _ => panic!("expected mailgun credentials"),
        }
    }
}
