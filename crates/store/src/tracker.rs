use async_trait::async_trait;
use uuid::Uuid;

use courier_core::{
    CampaignStats, DeliveryStatus, EngagementKind, Message, MessageRecipient, Recipient,
    RecipientSummary, RecipientType, normalize_email, sender_domain,
};

use crate::error::StoreError;

/// The workspace scope a message's recipients are tracked under: the
/// explicit `workspace_id` when the producer set one, else the sender
/// domain, else a catch-all.
#[must_use]
pub fn workspace_scope(message: &Message) -> String {
    message
        .workspace_id
        .clone()
        .or_else(|| sender_domain(&message.from))
        .unwrap_or_else(|| "default".to_owned())
}

/// The envelope slots of a message: normalized addresses paired with
/// their slot kind, deduplicated within each slot.
#[must_use]
pub fn envelope_slots(message: &Message) -> Vec<(String, RecipientType)> {
    let mut slots = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (addresses, kind) in [
        (&message.to, RecipientType::To),
        (&message.cc, RecipientType::Cc),
        (&message.bcc, RecipientType::Bcc),
    ] {
        for address in addresses {
            let email = normalize_email(address);
            if email.is_empty() {
                continue;
            }
            if seen.insert((email.clone(), kind)) {
                slots.push((email, kind));
            }
        }
    }
    slots
}

/// Per-recipient delivery and engagement bookkeeping.
///
/// Implementations own the `recipients` / `message_recipients` /
/// `recipient_events` rows and must apply
/// [`process_message_recipients`](RecipientTracker::process_message_recipients)
/// all-or-nothing.
#[async_trait]
pub trait RecipientTracker: Send + Sync {
    /// Expand a message's TO ∪ CC ∪ BCC into recipient and
    /// message-recipient rows. Addresses are normalized (trimmed,
    /// lowercased); recipients are created `active` on first reference;
    /// junction rows start `pending`. Transactional: on error, no rows
    /// from this call survive.
    async fn process_message_recipients(
        &self,
        message: &Message,
    ) -> Result<Vec<MessageRecipient>, StoreError>;

    /// Addresses of the message's recipients that are still deliverable
    /// (not unsubscribed, not bounce-suppressed), in envelope order.
    async fn deliverable_recipients(&self, message: &Message) -> Result<Vec<String>, StoreError>;

    /// Update one recipient's delivery status (webhook path). `sent`
    /// stamps `sent_at`; `bounced` runs recipient bounce bookkeeping with
    /// the given reason. Illegal transitions (`sent → pending`,
    /// `bounced → sent`) are ignored.
    async fn update_delivery_status(
        &self,
        message_id: Uuid,
        email: &str,
        status: DeliveryStatus,
        bounce_reason: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record a dispatch outcome against the recipients the attempt
    /// actually covered (dispatcher path): applies the delivery status,
    /// stamps the gateway identity, and bumps the per-recipient attempt
    /// counters. `recipients` holds normalized addresses; junction rows
    /// for suppressed recipients excluded from the envelope stay
    /// `pending` and never acquire a sent or bounced state.
    async fn record_dispatch_outcome(
        &self,
        message_id: Uuid,
        recipients: &[String],
        status: DeliveryStatus,
        gateway_id: Option<&str>,
        gateway_kind: Option<&str>,
        bounce_reason: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Append an engagement event and apply its side-effects (`open` and
    /// `click` bump monotonic counters; `unsubscribe` finalizes the
    /// recipient; `complaint` and `bounce` are log-only here).
    async fn record_engagement(
        &self,
        message_id: Uuid,
        email: &str,
        kind: EngagementKind,
        data: serde_json::Value,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Aggregate totals and engagement rate for one recipient.
    async fn recipient_summary(
        &self,
        email: &str,
        workspace_id: &str,
    ) -> Result<Option<RecipientSummary>, StoreError>;

    /// Aggregate totals and rates for one campaign.
    async fn campaign_stats(
        &self,
        campaign_id: &str,
        workspace_id: &str,
    ) -> Result<CampaignStats, StoreError>;

    /// Fetch a recipient identity.
    async fn get_recipient(
        &self,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<Recipient>, StoreError>;

    /// Fetch the junction row for one recipient of one message.
    async fn get_message_recipient(
        &self,
        message_id: Uuid,
        email: &str,
    ) -> Result<Option<MessageRecipient>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_scope_prefers_explicit_id() {
        let msg = Message::new("a@mail.example.com", vec!["b@x.com".into()])
            .with_workspace_id("ws-7");
        assert_eq!(workspace_scope(&msg), "ws-7");
    }

    #[test]
    fn workspace_scope_falls_back_to_sender_domain() {
        let msg = Message::new("a@Mail.Example.com", vec!["b@x.com".into()]);
        assert_eq!(workspace_scope(&msg), "mail.example.com");
    }

    #[test]
    fn workspace_scope_catch_all() {
        let msg = Message::new("not-an-address", vec!["b@x.com".into()]);
        assert_eq!(workspace_scope(&msg), "default");
    }
}
