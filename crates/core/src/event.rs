use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engagement event types recorded against a message recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Open,
    Click,
    Unsubscribe,
    Complaint,
    Bounce,
}

impl EngagementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Click => "click",
            Self::Unsubscribe => "unsubscribe",
            Self::Complaint => "complaint",
            Self::Bounce => "bounce",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "click" => Some(Self::Click),
            "unsubscribe" => Some(Self::Unsubscribe),
            "complaint" => Some(Self::Complaint),
            "bounce" => Some(Self::Bounce),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngagementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only engagement log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientEvent {
    pub id: Uuid,
    pub message_recipient_id: Uuid,
    pub event_type: EngagementKind,
    /// Provider-supplied event payload.
    #[serde(default)]
    pub event_data: serde_json::Value,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RecipientEvent {
    #[must_use]
    pub fn new(message_recipient_id: Uuid, event_type: EngagementKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_recipient_id,
            event_type,
            event_data: serde_json::Value::Null,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }
}

/// Canonical delivery lifecycle event set. Provider callbacks and the
/// dispatcher's own outcomes both map onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    /// Message handed to a gateway.
    Send,
    /// Delivery postponed (rate limit, credential problem, soft failure).
    Defer,
    Open,
    Click,
    Bounce,
    /// Permanently rejected before or by the provider.
    Reject,
    Spam,
    Unsub,
}

impl DeliveryEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Defer => "defer",
            Self::Open => "open",
            Self::Click => "click",
            Self::Bounce => "bounce",
            Self::Reject => "reject",
            Self::Spam => "spam",
            Self::Unsub => "unsub",
        }
    }
}

impl std::fmt::Display for DeliveryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
