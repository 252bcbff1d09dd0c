use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use courier_core::{HourlyBucket, Message, MessageStatus};

use crate::error::StoreError;

/// Sent-volume aggregates over the trailing 24 hours, keyed by gateway id
/// then by sender address. Used to warm the rate limiter at boot.
pub type SentCounts = HashMap<String, HashMap<String, u64>>;

/// Durable FIFO-ish message queue with claim semantics.
///
/// Implementations must guarantee that [`dequeue`](MessageQueue::dequeue)
/// hands each message to at most one caller: a claimed message is flipped
/// to [`MessageStatus::Processing`] atomically with the claim.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Persist a new message with `status=queued`. Fails with
    /// [`StoreError::Duplicate`] if the id is already present.
    async fn enqueue(&self, message: Message) -> Result<(), StoreError>;

    /// Atomically claim up to `batch_size` dispatch-eligible messages
    /// (queued, or failed/auth-errored within the retry budget), oldest
    /// first, flipping each to `processing`.
    async fn dequeue(&self, batch_size: usize) -> Result<Vec<Message>, StoreError>;

    /// Record a terminal-or-retriable outcome: sets `status`, increments
    /// `retry_count`, stamps `processed_at`, and for `sent` also stamps
    /// `sent_at`.
    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Like [`update_status`](MessageQueue::update_status) but also records
    /// the gateway that handled the message.
    async fn update_status_with_gateway(
        &self,
        id: Uuid,
        status: MessageStatus,
        gateway_id: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Return a rate-limited message to the queue without consuming retry
    /// budget: sets `status=queued`, leaves `retry_count` untouched.
    async fn mark_queued(&self, id: Uuid) -> Result<(), StoreError>;

    /// Fetch a message by id.
    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Delete a message. Returns `true` if it existed.
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Sent counts per `(gateway, sender)` over the trailing 24 hours.
    async fn sent_counts_by_gateway_and_sender(&self) -> Result<SentCounts, StoreError>;

    /// Number of messages per lifecycle status.
    async fn status_counts(&self) -> Result<HashMap<MessageStatus, u64>, StoreError>;

    /// Messages enqueued since UTC midnight.
    async fn counts_today(&self) -> Result<u64, StoreError>;

    /// Sent/failed volume per hour over the last `hours` hours, oldest
    /// bucket first.
    async fn hourly_sent_counts(&self, hours: u32) -> Result<Vec<HourlyBucket>, StoreError>;
}
