use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, DurationRound, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use courier_core::{
    CampaignStats, DeliveryStatus, EngagementKind, HourlyBucket, Message, MessageRecipient,
    MessageStatus, Recipient, RecipientEvent, RecipientSummary, RecipientType, classify_bounce,
    normalize_email,
};

use crate::error::StoreError;
use crate::queue::{MessageQueue, SentCounts};
use crate::tracker::{RecipientTracker, envelope_slots, workspace_scope};

/// In-memory [`MessageQueue`] backed by a single mutex.
///
/// Claim exclusivity falls out of the lock: a dequeue selects and flips
/// rows to `processing` in one critical section, so concurrent dispatchers
/// can never claim the same message. Intended for tests and local
/// development.
#[derive(Default)]
pub struct MemoryMessageQueue {
    messages: Mutex<HashMap<Uuid, Message>>,
}

impl MemoryMessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently held, regardless of status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the queue holds no messages at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl MessageQueue for MemoryMessageQueue {
    async fn enqueue(&self, message: Message) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        if messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(format!("message {}", message.id)));
        }
        messages.insert(message.id, message);
        Ok(())
    }

    async fn dequeue(&self, batch_size: usize) -> Result<Vec<Message>, StoreError> {
        let mut messages = self.messages.lock();
        let mut eligible: Vec<Uuid> = messages
            .values()
            .filter(|m| m.status.is_dispatchable(m.retry_count))
            .map(|m| m.id)
            .collect();
        eligible.sort_by_key(|id| messages[id].queued_at);
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(message) = messages.get_mut(&id) {
                message.status = MessageStatus::Processing;
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        let now = Utc::now();
        message.status = status;
        message.retry_count += 1;
        message.processed_at = Some(now);
        message.error = error.map(ToOwned::to_owned);
        if status == MessageStatus::Sent {
            message.sent_at = Some(now);
        }
        Ok(())
    }

    async fn update_status_with_gateway(
        &self,
        id: Uuid,
        status: MessageStatus,
        gateway_id: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update_status(id, status, error).await?;
        let mut messages = self.messages.lock();
        if let Some(message) = messages.get_mut(&id) {
            message.provider_id = Some(gateway_id.to_owned());
        }
        Ok(())
    }

    async fn mark_queued(&self, id: Uuid) -> Result<(), StoreError> {
        let mut messages = self.messages.lock();
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        message.status = MessageStatus::Queued;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.lock().get(&id).cloned())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.messages.lock().remove(&id).is_some())
    }

    async fn sent_counts_by_gateway_and_sender(&self) -> Result<SentCounts, StoreError> {
        let cutoff = Utc::now() - Duration::hours(24);
        let messages = self.messages.lock();
        let mut counts: SentCounts = HashMap::new();
        for message in messages.values() {
            if message.status != MessageStatus::Sent {
                continue;
            }
            let Some(sent_at) = message.sent_at else {
                continue;
            };
            if sent_at < cutoff {
                continue;
            }
            let Some(gateway) = &message.provider_id else {
                continue;
            };
            *counts
                .entry(gateway.clone())
                .or_default()
                .entry(normalize_email(&message.from))
                .or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn status_counts(&self) -> Result<HashMap<MessageStatus, u64>, StoreError> {
        let messages = self.messages.lock();
        let mut counts = HashMap::new();
        for message in messages.values() {
            *counts.entry(message.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn counts_today(&self) -> Result<u64, StoreError> {
        let midnight = Utc::now()
            .duration_trunc(Duration::days(1))
            .unwrap_or_else(|_| Utc::now());
        let messages = self.messages.lock();
        Ok(messages
            .values()
            .filter(|m| m.queued_at >= midnight)
            .count() as u64)
    }

    async fn hourly_sent_counts(&self, hours: u32) -> Result<Vec<HourlyBucket>, StoreError> {
        let now = Utc::now();
        let start = now
            .duration_trunc(Duration::hours(1))
            .unwrap_or(now)
            - Duration::hours(i64::from(hours.saturating_sub(1)));
        let messages = self.messages.lock();

        let mut buckets: Vec<HourlyBucket> = (0..hours)
            .map(|i| HourlyBucket {
                hour: start + Duration::hours(i64::from(i)),
                sent: 0,
                failed: 0,
            })
            .collect();

        for message in messages.values() {
            let stamp = match message.status {
                MessageStatus::Sent => message.sent_at,
                MessageStatus::Failed | MessageStatus::AuthError => message.processed_at,
                _ => None,
            };
            let Some(stamp) = stamp else { continue };
            if stamp < start {
                continue;
            }
            let offset = (stamp - start).num_hours();
            if let Ok(idx) = usize::try_from(offset)
                && let Some(bucket) = buckets.get_mut(idx)
            {
                if message.status == MessageStatus::Sent {
                    bucket.sent += 1;
                } else {
                    bucket.failed += 1;
                }
            }
        }
        Ok(buckets)
    }
}

/// Per-message bookkeeping the tracker needs for aggregates.
#[derive(Debug, Clone)]
struct MessageMeta {
    workspace: String,
    campaign_id: Option<String>,
}

#[derive(Default)]
struct TrackerInner {
    /// Keyed by `(workspace, normalized email)`.
    recipients: HashMap<(String, String), Recipient>,
    message_recipients: Vec<MessageRecipient>,
    events: Vec<RecipientEvent>,
    message_meta: HashMap<Uuid, MessageMeta>,
}

impl TrackerInner {
    fn recipient_by_id(&self, id: Uuid) -> Option<&Recipient> {
        self.recipients.values().find(|r| r.id == id)
    }

    fn junction_index(&self, message_id: Uuid, email: &str) -> Option<usize> {
        let email = normalize_email(email);
        let meta = self.message_meta.get(&message_id)?;
        let recipient = self.recipients.get(&(meta.workspace.clone(), email))?;
        let recipient_id = recipient.id;
        self.message_recipients
            .iter()
            .position(|mr| mr.message_id == message_id && mr.recipient_id == recipient_id)
    }
}

/// In-memory [`RecipientTracker`]. The reference implementation of the
/// tracking semantics; the Postgres backend mirrors this behavior in SQL.
#[derive(Default)]
pub struct MemoryRecipientTracker {
    inner: Mutex<TrackerInner>,
}

impl MemoryRecipientTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total engagement events recorded (tests).
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }
}

#[async_trait]
impl RecipientTracker for MemoryRecipientTracker {
    async fn process_message_recipients(
        &self,
        message: &Message,
    ) -> Result<Vec<MessageRecipient>, StoreError> {
        let workspace = workspace_scope(message);
        let slots = envelope_slots(message);
        if slots.is_empty() {
            return Err(StoreError::Backend(format!(
                "message {} has no recipients",
                message.id
            )));
        }

        // Stage everything, then commit; an error leaves nothing behind.
        // Re-expansion on a retry attempt is an upsert: existing junction
        // rows are reused untouched.
        let mut inner = self.inner.lock();
        let mut new_recipients: Vec<Recipient> = Vec::new();
        let mut created: Vec<MessageRecipient> = Vec::new();
        let mut rows: Vec<MessageRecipient> = Vec::new();

        for (email, kind) in slots {
            let key = (workspace.clone(), email.clone());
            let recipient_id = match inner.recipients.get(&key) {
                Some(existing) => existing.id,
                None => match new_recipients.iter().find(|r| r.email_address == email) {
                    Some(staged) => staged.id,
                    None => {
                        let mut recipient = Recipient::new(&workspace, &email);
                        recipient.campaign_id = message.campaign_id.clone();
                        recipient.user_id = message.user_id.clone();
                        let id = recipient.id;
                        new_recipients.push(recipient);
                        id
                    }
                },
            };
            let existing = inner.message_recipients.iter().find(|mr| {
                mr.message_id == message.id
                    && mr.recipient_id == recipient_id
                    && mr.recipient_type == kind
            });
            if let Some(existing) = existing {
                rows.push(existing.clone());
            } else {
                let junction = MessageRecipient::new(message.id, recipient_id, kind);
                created.push(junction.clone());
                rows.push(junction);
            }
        }

        for recipient in new_recipients {
            inner
                .recipients
                .insert((workspace.clone(), recipient.email_address.clone()), recipient);
        }
        inner.message_recipients.extend(created);
        inner.message_meta.insert(
            message.id,
            MessageMeta {
                workspace,
                campaign_id: message.campaign_id.clone(),
            },
        );
        Ok(rows)
    }

    async fn deliverable_recipients(&self, message: &Message) -> Result<Vec<String>, StoreError> {
        let workspace = workspace_scope(message);
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (email, _) in envelope_slots(message) {
            if !seen.insert(email.clone()) {
                continue;
            }
            let deliverable = inner
                .recipients
                .get(&(workspace.clone(), email.clone()))
                .is_none_or(|r| r.status.is_deliverable());
            if deliverable {
                out.push(email);
            }
        }
        Ok(out)
    }

    async fn update_delivery_status(
        &self,
        message_id: Uuid,
        email: &str,
        status: DeliveryStatus,
        bounce_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let idx = inner.junction_index(message_id, email).ok_or_else(|| {
            StoreError::NotFound(format!("message recipient ({message_id}, {email})"))
        })?;
        let now = Utc::now();

        let junction = &mut inner.message_recipients[idx];
        if !junction.delivery_status.allows_transition_to(status) {
            return Ok(());
        }
        junction.delivery_status = status;
        match status {
            DeliveryStatus::Sent => junction.sent_at = Some(now),
            DeliveryStatus::Bounced => {
                junction.bounce_reason = bounce_reason.map(ToOwned::to_owned);
            }
            _ => {}
        }
        let recipient_id = junction.recipient_id;

        if status == DeliveryStatus::Bounced {
            let bounce_type = classify_bounce(bounce_reason.unwrap_or_default());
            if let Some(recipient) = inner
                .recipients
                .values_mut()
                .find(|r| r.id == recipient_id)
            {
                recipient.record_bounce(bounce_type, now);
            }
        }
        Ok(())
    }

    async fn record_dispatch_outcome(
        &self,
        message_id: Uuid,
        recipients: &[String],
        status: DeliveryStatus,
        gateway_id: Option<&str>,
        gateway_kind: Option<&str>,
        bounce_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut bounced_recipients = Vec::new();

        // Only the recipients the attempt covered; suppressed junction
        // rows stay pending.
        let emails: std::collections::HashSet<String> =
            recipients.iter().map(|e| normalize_email(e)).collect();
        let covered: std::collections::HashSet<Uuid> = inner
            .recipients
            .values()
            .filter(|r| emails.contains(&r.email_address))
            .map(|r| r.id)
            .collect();

        for junction in inner
            .message_recipients
            .iter_mut()
            .filter(|mr| mr.message_id == message_id && covered.contains(&mr.recipient_id))
        {
            junction.send_attempt_count += 1;
            junction.last_send_attempt = Some(now);
            if let Some(id) = gateway_id {
                junction.gateway_id = Some(id.to_owned());
            }
            if let Some(kind) = gateway_kind {
                junction.gateway_kind = Some(kind.to_owned());
            }
            if !junction.delivery_status.allows_transition_to(status) {
                continue;
            }
            junction.delivery_status = status;
            match status {
                DeliveryStatus::Sent => junction.sent_at = Some(now),
                DeliveryStatus::Bounced => {
                    junction.bounce_reason = bounce_reason.map(ToOwned::to_owned);
                    bounced_recipients.push(junction.recipient_id);
                }
                _ => {}
            }
        }

        if status == DeliveryStatus::Bounced {
            let bounce_type = classify_bounce(bounce_reason.unwrap_or_default());
            for recipient_id in bounced_recipients {
                if let Some(recipient) = inner
                    .recipients
                    .values_mut()
                    .find(|r| r.id == recipient_id)
                {
                    recipient.record_bounce(bounce_type, now);
                }
            }
        }
        Ok(())
    }

    async fn record_engagement(
        &self,
        message_id: Uuid,
        email: &str,
        kind: EngagementKind,
        data: serde_json::Value,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let idx = inner.junction_index(message_id, email).ok_or_else(|| {
            StoreError::NotFound(format!("message recipient ({message_id}, {email})"))
        })?;
        let now = Utc::now();

        let junction = &mut inner.message_recipients[idx];
        let junction_id = junction.id;
        let recipient_id = junction.recipient_id;
        match kind {
            EngagementKind::Open => {
                junction.opens += 1;
                junction.last_open_at = Some(now);
            }
            EngagementKind::Click => {
                junction.clicks += 1;
                junction.last_click_at = Some(now);
            }
            EngagementKind::Unsubscribe => {
                if let Some(recipient) = inner
                    .recipients
                    .values_mut()
                    .find(|r| r.id == recipient_id)
                {
                    recipient.record_unsubscribe(now);
                }
            }
            // Bounce state is driven through update_delivery_status; the
            // event is only logged here.
            EngagementKind::Complaint | EngagementKind::Bounce => {}
        }

        let mut event = RecipientEvent::new(junction_id, kind);
        event.event_data = data;
        event.ip_address = ip.map(ToOwned::to_owned);
        event.user_agent = user_agent.map(ToOwned::to_owned);
        inner.events.push(event);
        Ok(())
    }

    async fn recipient_summary(
        &self,
        email: &str,
        workspace_id: &str,
    ) -> Result<Option<RecipientSummary>, StoreError> {
        let email = normalize_email(email);
        let inner = self.inner.lock();
        let Some(recipient) = inner
            .recipients
            .get(&(workspace_id.to_owned(), email.clone()))
        else {
            return Ok(None);
        };

        let rows: Vec<&MessageRecipient> = inner
            .message_recipients
            .iter()
            .filter(|mr| mr.recipient_id == recipient.id)
            .collect();
        let total_messages = rows.len() as u64;
        let total_sent = rows
            .iter()
            .filter(|mr| mr.delivery_status == DeliveryStatus::Sent)
            .count() as u64;
        let total_bounced = rows
            .iter()
            .filter(|mr| mr.delivery_status == DeliveryStatus::Bounced)
            .count() as u64;
        let total_opens: u64 = rows.iter().map(|mr| u64::from(mr.opens)).sum();
        let total_clicks: u64 = rows.iter().map(|mr| u64::from(mr.clicks)).sum();
        #[allow(clippy::cast_precision_loss)]
        let engagement_rate = if total_messages == 0 {
            0.0
        } else {
            (total_opens + total_clicks) as f64 / total_messages as f64
        };

        Ok(Some(RecipientSummary {
            email_address: email,
            workspace_id: workspace_id.to_owned(),
            status: recipient.status,
            total_messages,
            total_sent,
            total_bounced,
            total_opens,
            total_clicks,
            bounce_count: recipient.bounce_count,
            engagement_rate,
        }))
    }

    async fn campaign_stats(
        &self,
        campaign_id: &str,
        workspace_id: &str,
    ) -> Result<CampaignStats, StoreError> {
        let inner = self.inner.lock();
        let message_ids: std::collections::HashSet<Uuid> = inner
            .message_meta
            .iter()
            .filter(|(_, meta)| {
                meta.workspace == workspace_id && meta.campaign_id.as_deref() == Some(campaign_id)
            })
            .map(|(id, _)| *id)
            .collect();

        let rows: Vec<&MessageRecipient> = inner
            .message_recipients
            .iter()
            .filter(|mr| message_ids.contains(&mr.message_id))
            .collect();

        let total_recipients = rows.len() as u64;
        let total_sent = rows
            .iter()
            .filter(|mr| mr.delivery_status == DeliveryStatus::Sent)
            .count() as u64;
        let total_bounced = rows
            .iter()
            .filter(|mr| mr.delivery_status == DeliveryStatus::Bounced)
            .count() as u64;
        let total_opens: u64 = rows.iter().map(|mr| u64::from(mr.opens)).sum();
        let total_clicks: u64 = rows.iter().map(|mr| u64::from(mr.clicks)).sum();
        let opened = rows.iter().filter(|mr| mr.opens > 0).count() as u64;
        let clicked = rows.iter().filter(|mr| mr.clicks > 0).count() as u64;

        #[allow(clippy::cast_precision_loss)]
        let rate = |num: u64, den: u64| {
            if den == 0 { 0.0 } else { num as f64 / den as f64 }
        };

        Ok(CampaignStats {
            campaign_id: campaign_id.to_owned(),
            workspace_id: workspace_id.to_owned(),
            total_recipients,
            total_sent,
            total_bounced,
            total_opens,
            total_clicks,
            open_rate: rate(opened, total_sent),
            click_rate: rate(clicked, total_sent),
            bounce_rate: rate(total_bounced, total_recipients),
        })
    }

    async fn get_recipient(
        &self,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<Recipient>, StoreError> {
        let email = normalize_email(email);
        Ok(self
            .inner
            .lock()
            .recipients
            .get(&(workspace_id.to_owned(), email))
            .cloned())
    }

    async fn get_message_recipient(
        &self,
        message_id: Uuid,
        email: &str,
    ) -> Result<Option<MessageRecipient>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .junction_index(message_id, email)
            .map(|idx| inner.message_recipients[idx].clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use courier_core::RecipientStatus;

    use super::*;

    fn queued_message(from: &str, to: &str) -> Message {
        Message::new(from, vec![to.into()]).with_subject("s").with_text("t")
    }

    // -- queue ------------------------------------------------------------

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let queue = MemoryMessageQueue::new();
        let msg = queued_message("a@x.com", "b@y.com");
        queue.enqueue(msg.clone()).await.unwrap();
        let err = queue.enqueue(msg).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn dequeue_claims_oldest_first_and_flips_to_processing() {
        let queue = MemoryMessageQueue::new();
        let mut first = queued_message("a@x.com", "b@y.com");
        first.queued_at = Utc::now() - Duration::minutes(10);
        let second = queued_message("a@x.com", "c@y.com");
        queue.enqueue(second.clone()).await.unwrap();
        queue.enqueue(first.clone()).await.unwrap();

        let batch = queue.dequeue(1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, first.id);
        assert_eq!(batch[0].status, MessageStatus::Processing);

        // The claimed message is invisible to a second dequeue.
        let batch2 = queue.dequeue(10).await.unwrap();
        assert_eq!(batch2.len(), 1);
        assert_eq!(batch2[0].id, second.id);
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_claim_twice() {
        let queue = Arc::new(MemoryMessageQueue::new());
        for i in 0..40 {
            let mut msg = queued_message("a@x.com", &format!("r{i}@y.com"));
            msg.queued_at = Utc::now() - Duration::seconds(60 - i);
            queue.enqueue(msg).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move { queue.dequeue(10).await.unwrap() }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for msg in handle.await.unwrap() {
                assert!(seen.insert(msg.id), "message {} claimed twice", msg.id);
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn failed_messages_requeue_until_budget_exhausted() {
        let queue = MemoryMessageQueue::new();
        let msg = queued_message("a@x.com", "b@y.com");
        let id = msg.id;
        queue.enqueue(msg).await.unwrap();

        for attempt in 1..=3 {
            let batch = queue.dequeue(10).await.unwrap();
            assert_eq!(batch.len(), 1, "attempt {attempt} should dequeue");
            queue
                .update_status(id, MessageStatus::Failed, Some("boom"))
                .await
                .unwrap();
        }

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 3);
        assert_eq!(stored.status, MessageStatus::Failed);
        assert!(queue.dequeue(10).await.unwrap().is_empty(), "budget exhausted");
    }

    #[tokio::test]
    async fn mark_queued_preserves_retry_count() {
        let queue = MemoryMessageQueue::new();
        let msg = queued_message("a@x.com", "b@y.com");
        let id = msg.id;
        queue.enqueue(msg).await.unwrap();
        queue.dequeue(1).await.unwrap();

        queue.mark_queued(id).await.unwrap();
        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Queued);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn sent_stamps_sent_at_and_gateway() {
        let queue = MemoryMessageQueue::new();
        let msg = queued_message("a@x.com", "b@y.com");
        let id = msg.id;
        queue.enqueue(msg).await.unwrap();
        queue
            .update_status_with_gateway(id, MessageStatus::Sent, "mg1", None)
            .await
            .unwrap();
        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(stored.provider_id.as_deref(), Some("mg1"));
    }

    #[tokio::test]
    async fn warm_start_counts_group_by_gateway_and_sender() {
        let queue = MemoryMessageQueue::new();
        for (from, gateway) in [
            ("A@x.com", "mg1"),
            ("a@x.com", "mg1"),
            ("b@x.com", "mg1"),
            ("a@x.com", "md1"),
        ] {
            let msg = queued_message(from, "r@y.com");
            let id = msg.id;
            queue.enqueue(msg).await.unwrap();
            queue
                .update_status_with_gateway(id, MessageStatus::Sent, gateway, None)
                .await
                .unwrap();
        }

        let counts = queue.sent_counts_by_gateway_and_sender().await.unwrap();
        assert_eq!(counts["mg1"]["a@x.com"], 2);
        assert_eq!(counts["mg1"]["b@x.com"], 1);
        assert_eq!(counts["md1"]["a@x.com"], 1);
    }

    #[tokio::test]
    async fn status_counts_cover_all_messages() {
        let queue = MemoryMessageQueue::new();
        let sent = queued_message("a@x.com", "b@y.com");
        let sent_id = sent.id;
        queue.enqueue(sent).await.unwrap();
        queue
            .update_status(sent_id, MessageStatus::Sent, None)
            .await
            .unwrap();
        queue.enqueue(queued_message("a@x.com", "c@y.com")).await.unwrap();

        let counts = queue.status_counts().await.unwrap();
        assert_eq!(counts.get(&MessageStatus::Sent), Some(&1));
        assert_eq!(counts.get(&MessageStatus::Queued), Some(&1));
    }

    // -- tracker ----------------------------------------------------------

    fn tracked_message() -> Message {
        Message::new("sender@mail.example.com", vec!["To@X.com ".into()])
            .with_cc(vec!["cc@x.com".into()])
            .with_bcc(vec!["bcc@x.com".into()])
            .with_subject("s")
    }

    #[tokio::test]
    async fn expansion_creates_rows_for_every_slot() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        let rows = tracker.process_message_recipients(&msg).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.delivery_status == DeliveryStatus::Pending));

        // Addresses were normalized on the way in.
        let recipient = tracker
            .get_recipient("mail.example.com", "to@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recipient.status, RecipientStatus::Active);
    }

    #[tokio::test]
    async fn expansion_dedupes_within_slot_but_not_across_slots() {
        let tracker = MemoryRecipientTracker::new();
        let msg = Message::new(
            "sender@mail.example.com",
            vec!["dup@x.com".into(), "DUP@x.com".into()],
        )
        .with_cc(vec!["dup@x.com".into()]);
        let rows = tracker.process_message_recipients(&msg).await.unwrap();
        // One TO row (deduped) plus one CC row for the same recipient.
        assert_eq!(rows.len(), 2);
        let kinds: Vec<RecipientType> = rows.iter().map(|r| r.recipient_type).collect();
        assert_eq!(kinds, vec![RecipientType::To, RecipientType::Cc]);
        assert_eq!(rows[0].recipient_id, rows[1].recipient_id);
    }

    #[tokio::test]
    async fn re_expansion_on_retry_reuses_rows() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        let first = tracker.process_message_recipients(&msg).await.unwrap();
        let second = tracker.process_message_recipients(&msg).await.unwrap();
        assert_eq!(first.len(), second.len());
        let first_ids: Vec<_> = first.iter().map(|r| r.id).collect();
        let second_ids: Vec<_> = second.iter().map(|r| r.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn expansion_is_all_or_nothing() {
        let tracker = MemoryRecipientTracker::new();
        let msg = Message::new("sender@mail.example.com", Vec::new());
        let err = tracker.process_message_recipients(&msg).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(
            tracker
                .get_recipient("mail.example.com", "to@x.com")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unsubscribed_recipients_are_not_deliverable() {
        let tracker = MemoryRecipientTracker::new();
        let first = tracked_message();
        tracker.process_message_recipients(&first).await.unwrap();
        tracker
            .record_engagement(
                first.id,
                "to@x.com",
                EngagementKind::Unsubscribe,
                serde_json::Value::Null,
                None,
                None,
            )
            .await
            .unwrap();

        let second = tracked_message();
        tracker.process_message_recipients(&second).await.unwrap();
        let deliverable = tracker.deliverable_recipients(&second).await.unwrap();
        assert_eq!(deliverable, vec!["cc@x.com", "bcc@x.com"]);
    }

    #[tokio::test]
    async fn hard_bounce_escalates_recipient() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        tracker.process_message_recipients(&msg).await.unwrap();

        tracker
            .update_delivery_status(msg.id, "to@x.com", DeliveryStatus::Bounced, Some("user unknown"))
            .await
            .unwrap();

        let junction = tracker
            .get_message_recipient(msg.id, "to@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(junction.delivery_status, DeliveryStatus::Bounced);
        assert_eq!(junction.bounce_reason.as_deref(), Some("user unknown"));

        let recipient = tracker
            .get_recipient("mail.example.com", "to@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recipient.status, RecipientStatus::Bounced);
        assert_eq!(recipient.bounce_count, 1);
        assert_eq!(recipient.bounce_type, Some(courier_core::BounceType::Hard));
    }

    #[tokio::test]
    async fn soft_bounces_escalate_after_threshold() {
        let tracker = MemoryRecipientTracker::new();
        for i in 0..5 {
            let msg = Message::new("sender@mail.example.com", vec!["soft@x.com".into()]);
            tracker.process_message_recipients(&msg).await.unwrap();
            tracker
                .update_delivery_status(msg.id, "soft@x.com", DeliveryStatus::Bounced, Some("mailbox full"))
                .await
                .unwrap();
            let recipient = tracker
                .get_recipient("mail.example.com", "soft@x.com")
                .await
                .unwrap()
                .unwrap();
            if i < 4 {
                assert_eq!(recipient.status, RecipientStatus::Active);
            } else {
                assert_eq!(recipient.status, RecipientStatus::Bounced);
            }
        }
    }

    #[tokio::test]
    async fn bounced_never_downgrades_to_sent() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        tracker.process_message_recipients(&msg).await.unwrap();

        tracker
            .update_delivery_status(msg.id, "to@x.com", DeliveryStatus::Bounced, Some("user unknown"))
            .await
            .unwrap();
        tracker
            .update_delivery_status(msg.id, "to@x.com", DeliveryStatus::Sent, None)
            .await
            .unwrap();

        let junction = tracker
            .get_message_recipient(msg.id, "to@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(junction.delivery_status, DeliveryStatus::Bounced);
    }

    #[tokio::test]
    async fn dispatch_outcome_updates_covered_recipients() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        tracker.process_message_recipients(&msg).await.unwrap();

        let covered = vec![
            "to@x.com".to_owned(),
            "cc@x.com".to_owned(),
            "bcc@x.com".to_owned(),
        ];
        tracker
            .record_dispatch_outcome(
                msg.id,
                &covered,
                DeliveryStatus::Sent,
                Some("mg1"),
                Some("mailgun"),
                None,
            )
            .await
            .unwrap();

        for email in ["to@x.com", "cc@x.com", "bcc@x.com"] {
            let junction = tracker
                .get_message_recipient(msg.id, email)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(junction.delivery_status, DeliveryStatus::Sent);
            assert_eq!(junction.gateway_id.as_deref(), Some("mg1"));
            assert_eq!(junction.gateway_kind.as_deref(), Some("mailgun"));
            assert_eq!(junction.send_attempt_count, 1);
            assert!(junction.sent_at.is_some());
        }
    }

    #[tokio::test]
    async fn dispatch_outcome_leaves_uncovered_recipients_pending() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        tracker.process_message_recipients(&msg).await.unwrap();

        tracker
            .record_dispatch_outcome(
                msg.id,
                &["to@x.com".to_owned()],
                DeliveryStatus::Sent,
                Some("mg1"),
                Some("mailgun"),
                None,
            )
            .await
            .unwrap();

        let sent = tracker
            .get_message_recipient(msg.id, "to@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.delivery_status, DeliveryStatus::Sent);

        for email in ["cc@x.com", "bcc@x.com"] {
            let junction = tracker
                .get_message_recipient(msg.id, email)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(junction.delivery_status, DeliveryStatus::Pending);
            assert_eq!(junction.send_attempt_count, 0);
            assert!(junction.sent_at.is_none());
        }
    }

    #[tokio::test]
    async fn engagement_counters_are_monotonic() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        tracker.process_message_recipients(&msg).await.unwrap();

        for _ in 0..3 {
            tracker
                .record_engagement(
                    msg.id,
                    "to@x.com",
                    EngagementKind::Open,
                    serde_json::Value::Null,
                    Some("10.0.0.1"),
                    Some("curl/8"),
                )
                .await
                .unwrap();
        }
        tracker
            .record_engagement(
                msg.id,
                "to@x.com",
                EngagementKind::Click,
                serde_json::json!({"url": "https://example.com"}),
                None,
                None,
            )
            .await
            .unwrap();

        let junction = tracker
            .get_message_recipient(msg.id, "to@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(junction.opens, 3);
        assert_eq!(junction.clicks, 1);
        assert!(junction.last_open_at.is_some());
        assert!(junction.last_click_at.is_some());
        assert_eq!(tracker.event_count(), 4);
    }

    #[tokio::test]
    async fn engagement_for_unknown_recipient_is_not_found() {
        let tracker = MemoryRecipientTracker::new();
        let msg = tracked_message();
        tracker.process_message_recipients(&msg).await.unwrap();
        let err = tracker
            .record_engagement(
                msg.id,
                "stranger@x.com",
                EngagementKind::Open,
                serde_json::Value::Null,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn recipient_summary_math() {
        let tracker = MemoryRecipientTracker::new();
        let first = Message::new("s@mail.example.com", vec!["r@x.com".into()]);
        let second = Message::new("s@mail.example.com", vec!["r@x.com".into()]);
        tracker.process_message_recipients(&first).await.unwrap();
        tracker.process_message_recipients(&second).await.unwrap();

        tracker
            .record_dispatch_outcome(
                first.id,
                &["r@x.com".to_owned()],
                DeliveryStatus::Sent,
                Some("mg1"),
                Some("mailgun"),
                None,
            )
            .await
            .unwrap();
        tracker
            .record_engagement(
                first.id,
                "r@x.com",
                EngagementKind::Open,
                serde_json::Value::Null,
                None,
                None,
            )
            .await
            .unwrap();

        let summary = tracker
            .recipient_summary("r@x.com", "mail.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_messages, 2);
        assert_eq!(summary.total_sent, 1);
        assert_eq!(summary.total_opens, 1);
        assert!((summary.engagement_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn campaign_stats_math() {
        let tracker = MemoryRecipientTracker::new();
        for i in 0..4 {
            let msg = Message::new("s@mail.example.com", vec![format!("r{i}@x.com")])
                .with_campaign_id("camp-1");
            tracker.process_message_recipients(&msg).await.unwrap();
            if i < 3 {
                tracker
                    .record_dispatch_outcome(
                        msg.id,
                        &[format!("r{i}@x.com")],
                        DeliveryStatus::Sent,
                        Some("mg1"),
                        Some("mailgun"),
                        None,
                    )
                    .await
                    .unwrap();
            } else {
                tracker
                    .update_delivery_status(msg.id, &format!("r{i}@x.com"), DeliveryStatus::Bounced, Some("user unknown"))
                    .await
                    .unwrap();
            }
            if i == 0 {
                tracker
                    .record_engagement(
                        msg.id,
                        "r0@x.com",
                        EngagementKind::Open,
                        serde_json::Value::Null,
                        None,
                        None,
                    )
                    .await
                    .unwrap();
            }
        }

        let stats = tracker
            .campaign_stats("camp-1", "mail.example.com")
            .await
            .unwrap();
        assert_eq!(stats.total_recipients, 4);
        assert_eq!(stats.total_sent, 3);
        assert_eq!(stats.total_bounced, 1);
        assert!((stats.open_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((stats.bounce_rate - 0.25).abs() < f64::EPSILON);
    }
}
