use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of bounces after which a recipient is suppressed regardless of
/// bounce severity.
pub const BOUNCE_SUPPRESSION_THRESHOLD: u32 = 5;

/// Subscription state of a per-workspace recipient identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Active,
    Inactive,
    /// Suppressed after a hard bounce or repeated soft bounces.
    Bounced,
    /// Opted out. Final — the dispatcher must never send to them again.
    Unsubscribed,
}

impl RecipientStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Bounced => "bounced",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "bounced" => Some(Self::Bounced),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }

    /// Whether mail may still be sent to a recipient in this state.
    #[must_use]
    pub fn is_deliverable(self) -> bool {
        matches!(self, Self::Active | Self::Inactive)
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a bounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    /// Transient failure (full mailbox, greylisting).
    Soft,
    /// Permanent failure (unknown user, invalid domain).
    Hard,
}

impl BounceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "soft" => Some(Self::Soft),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }
}

/// Classify a bounce reason string. Reasons indicating a permanently
/// undeliverable address are hard bounces; everything else is soft.
#[must_use]
pub fn classify_bounce(reason: &str) -> BounceType {
    let lower = reason.to_ascii_lowercase();
    const HARD_MARKERS: [&str; 4] = ["permanent", "invalid", "not exist", "unknown user"];
    if HARD_MARKERS.iter().any(|m| lower.contains(m)) {
        BounceType::Hard
    } else {
        BounceType::Soft
    }
}

/// A stable per-workspace identity for an email address, distinct from any
/// single send to that address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    /// Workspace (gateway) scope of this identity.
    pub workspace_id: String,
    /// Normalized (trimmed, lowercased) address. Unique within a workspace.
    pub email_address: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    pub status: RecipientStatus,
    #[serde(default)]
    pub opt_in_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub opt_out_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bounce_count: u32,
    #[serde(default)]
    pub last_bounce_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bounce_type: Option<BounceType>,
    /// Arbitrary metadata bag.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    /// Create a fresh active recipient for a workspace.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>, email_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            email_address: email_address.into(),
            user_id: None,
            campaign_id: None,
            first_name: None,
            last_name: None,
            status: RecipientStatus::Active,
            opt_in_date: Some(now),
            opt_out_date: None,
            bounce_count: 0,
            last_bounce_date: None,
            bounce_type: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply bounce bookkeeping: bump the counter, record the bounce type,
    /// and suppress the recipient when the bounce is hard or the counter
    /// reaches [`BOUNCE_SUPPRESSION_THRESHOLD`].
    pub fn record_bounce(&mut self, bounce_type: BounceType, at: DateTime<Utc>) {
        self.bounce_count += 1;
        self.last_bounce_date = Some(at);
        self.bounce_type = Some(bounce_type);
        if bounce_type == BounceType::Hard || self.bounce_count >= BOUNCE_SUPPRESSION_THRESHOLD {
            self.status = RecipientStatus::Bounced;
        }
        self.updated_at = at;
    }

    /// Apply an unsubscribe: final, stamps `opt_out_date`.
    pub fn record_unsubscribe(&mut self, at: DateTime<Utc>) {
        self.status = RecipientStatus::Unsubscribed;
        self.opt_out_date = Some(at);
        self.updated_at = at;
    }
}

/// Which envelope slot a recipient occupied on a particular message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

impl RecipientType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "to" => Some(Self::To),
            "cc" => Some(Self::Cc),
            "bcc" => Some(Self::Bcc),
            _ => None,
        }
    }
}

/// Delivery outcome for one recipient of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Bounced,
    Failed,
    /// Delivery postponed (credentials rejected, provider deferral).
    Deferred,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Bounced => "bounced",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "bounced" => Some(Self::Bounced),
            "failed" => Some(Self::Failed),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition. Guards
    /// the webhook/dispatcher race: `sent` never reverts to `pending`, and
    /// `bounced` is never overwritten by `sent`.
    #[must_use]
    pub fn allows_transition_to(self, next: Self) -> bool {
        !matches!(
            (self, next),
            (Self::Sent, Self::Pending) | (Self::Bounced, Self::Sent)
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Junction row: one send attempt to one recipient in one envelope slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub id: Uuid,
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_type: RecipientType,
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bounce_reason: Option<String>,
    /// Gateway that performed (or attempted) the send.
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub gateway_kind: Option<String>,
    #[serde(default)]
    pub send_attempt_count: u32,
    #[serde(default)]
    pub last_send_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub opens: u32,
    #[serde(default)]
    pub clicks: u32,
    #[serde(default)]
    pub last_open_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_click_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecipient {
    /// Create a pending junction row.
    #[must_use]
    pub fn new(message_id: Uuid, recipient_id: Uuid, recipient_type: RecipientType) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            recipient_id,
            recipient_type,
            delivery_status: DeliveryStatus::Pending,
            sent_at: None,
            bounce_reason: None,
            gateway_id: None,
            gateway_kind: None,
            send_attempt_count: 0,
            last_send_attempt: None,
            opens: 0,
            clicks: 0,
            last_open_at: None,
            last_click_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Aggregate delivery and engagement picture for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSummary {
    pub email_address: String,
    pub workspace_id: String,
    pub status: RecipientStatus,
    pub total_messages: u64,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub bounce_count: u32,
    /// `(opens + clicks) / total_messages`; 0 when nothing was sent.
    pub engagement_rate: f64,
}

/// Aggregate stats for one campaign within a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: String,
    pub workspace_id: String,
    pub total_recipients: u64,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub bounce_rate: f64,
}
