use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of delivery attempts before a message is pinned in
/// [`MessageStatus::Failed`].
pub const MAX_RETRIES: u32 = 3;

/// Lifecycle state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting in the queue for a dispatcher to claim it.
    Queued,
    /// Claimed by exactly one in-flight dispatcher.
    Processing,
    /// Accepted by a gateway. Terminal.
    Sent,
    /// Delivery failed. Retriable while the retry budget lasts.
    Failed,
    /// The gateway rejected our credentials. Retriable like `Failed`.
    AuthError,
}

impl MessageStatus {
    /// Database / wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::AuthError => "auth_error",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "auth_error" => Some(Self::AuthError),
            _ => None,
        }
    }

    /// Whether a message in this state, with the given retry count, is
    /// eligible for dispatch. `Queued` is always eligible; `Failed` and
    /// `AuthError` retry until the budget is exhausted.
    #[must_use]
    pub fn is_dispatchable(self, retry_count: u32) -> bool {
        match self {
            Self::Queued => true,
            Self::Failed | Self::AuthError => retry_count < MAX_RETRIES,
            Self::Processing | Self::Sent => false,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file attached to an outbound message. Content is base64-encoded as
/// supplied by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Base64-encoded file content.
    pub content: String,
}

/// A single outbound submission and its lifecycle state.
///
/// The envelope and content fields are immutable once enqueued; the
/// dispatcher owns `status`, `retry_count`, the lifecycle timestamps, and
/// the terminal `error`/`provider_id` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: Uuid,

    /// Envelope sender address.
    pub from: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// Blind-carbon-copy recipients.
    #[serde(default)]
    pub bcc: Vec<String>,

    /// Subject line.
    pub subject: String,
    /// HTML body, if any.
    #[serde(default)]
    pub html: Option<String>,
    /// Plain-text body, if any.
    #[serde(default)]
    pub text: Option<String>,
    /// Additional headers supplied by the producer.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// File attachments.
    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Gateway (workspace) the sender belongs to, when known up front.
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Campaign correlation id.
    #[serde(default)]
    pub campaign_id: Option<String>,
    /// Originating user id.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Invitation correlation id.
    #[serde(default)]
    pub invitation_id: Option<String>,

    /// Delivery attempts consumed so far.
    #[serde(default)]
    pub retry_count: u32,

    /// When the message entered the queue.
    pub queued_at: DateTime<Utc>,
    /// When a dispatcher last finished processing it.
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// When a gateway accepted it.
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,

    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Last delivery error, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// Gateway that last handled the message.
    #[serde(default)]
    pub provider_id: Option<String>,
}

impl Message {
    /// Create a new queued message with the required envelope fields.
    /// Generates a UUID-v4 id and stamps `queued_at` with the current time.
    #[must_use]
    pub fn new(from: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            html: None,
            text: None,
            headers: HashMap::new(),
            attachments: Vec::new(),
            workspace_id: None,
            campaign_id: None,
            user_id: None,
            invitation_id: None,
            retry_count: 0,
            queued_at: Utc::now(),
            processed_at: None,
            sent_at: None,
            status: MessageStatus::Queued,
            error: None,
            provider_id: None,
        }
    }

    /// Set the subject line.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the HTML body.
    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Set the plain-text body.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set CC recipients.
    #[must_use]
    pub fn with_cc(mut self, cc: Vec<String>) -> Self {
        self.cc = cc;
        self
    }

    /// Set BCC recipients.
    #[must_use]
    pub fn with_bcc(mut self, bcc: Vec<String>) -> Self {
        self.bcc = bcc;
        self
    }

    /// Add a producer-supplied header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the campaign correlation id.
    #[must_use]
    pub fn with_campaign_id(mut self, id: impl Into<String>) -> Self {
        self.campaign_id = Some(id.into());
        self
    }

    /// Set the originating user id.
    #[must_use]
    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Set the workspace (gateway) id.
    #[must_use]
    pub fn with_workspace_id(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    /// Set the invitation correlation id.
    #[must_use]
    pub fn with_invitation_id(mut self, id: impl Into<String>) -> Self {
        self.invitation_id = Some(id.into());
        self
    }

    /// The domain part of the envelope sender, lowercased.
    #[must_use]
    pub fn sender_domain(&self) -> Option<String> {
        sender_domain(&self.from)
    }

    /// All recipient addresses (TO ∪ CC ∪ BCC), in declaration order.
    pub fn all_recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
    }
}

/// Extract the lowercased domain from an email address.
#[must_use]
pub fn sender_domain(address: &str) -> Option<String> {
    let at = address.rfind('@')?;
    let domain = &address[at + 1..];
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Normalize an email address for storage and comparison: trim surrounding
/// whitespace and lowercase.
#[must_use]
pub fn normalize_email(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}
