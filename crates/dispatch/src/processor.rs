use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use courier_core::{
    DeliveryEventKind, DeliveryStatus, Message, MessageStatus, normalize_email,
};
use courier_gateway::{DynGateway, SendError};
use courier_store::{MessageQueue, RecipientTracker};

use crate::error::DispatchError;
use crate::events::{DeliveryEvent, DeliveryEvents, LogDeliveryEvents};
use crate::manager::GatewayManager;
use crate::metrics::DispatchMetrics;
use crate::variables::{VariableEngine, validate_resolved};

/// Tuning for the tick loop.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Interval between dequeue ticks.
    pub tick_interval: Duration,
    /// Messages claimed per tick.
    pub batch_size: usize,
    /// Concurrent in-flight messages within a tick.
    pub max_workers: usize,
    /// Per-send timeout.
    pub send_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            batch_size: 10,
            max_workers: 4,
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// Opaque personalization hook error.
#[derive(Debug, Error)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

/// Optional personalization step applied after substitution. A
/// transformer can rewrite content but is never allowed to make the
/// message invalid; the processor re-validates and discards bad output.
#[async_trait]
pub trait MessageTransformer: Send + Sync {
    async fn transform(&self, message: &Message) -> Result<Message, TransformError>;
}

/// The dispatch core: claims batches from the queue on an interval and
/// drives each message through
/// `expand → substitute → personalize → route → admit → breaker → send →
/// finalize`. Per-message failures never cross the message boundary;
/// only a failed claim aborts the tick.
pub struct QueueProcessor {
    queue: Arc<dyn MessageQueue>,
    tracker: Arc<dyn RecipientTracker>,
    manager: Arc<GatewayManager>,
    variables: Arc<VariableEngine>,
    transformer: Option<Arc<dyn MessageTransformer>>,
    events: Arc<dyn DeliveryEvents>,
    metrics: Arc<DispatchMetrics>,
    config: ProcessorConfig,
}

impl QueueProcessor {
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        tracker: Arc<dyn RecipientTracker>,
        manager: Arc<GatewayManager>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            manager,
            variables: Arc::new(VariableEngine::new()),
            transformer: None,
            events: Arc::new(LogDeliveryEvents),
            metrics: Arc::new(DispatchMetrics::new()),
            config,
        }
    }

    #[must_use]
    pub fn with_variables(mut self, engine: Arc<VariableEngine>) -> Self {
        self.variables = engine;
        self
    }

    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn MessageTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn DeliveryEvents>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run ticks on the configured interval until cancelled. In-flight
    /// sends run to their timeout after cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            batch_size = self.config.batch_size,
            "queue processor started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("queue processor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "tick aborted, retrying next interval");
                    }
                }
            }
        }
    }

    /// Claim and process one batch. Returns the number of messages
    /// claimed.
    pub async fn tick(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let batch = self.queue.dequeue(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        debug!(count = batch.len(), "claimed batch");

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut tasks = JoinSet::new();
        let count = batch.len();
        for message in batch {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.process_message(message).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(count)
    }

    #[instrument(skip(self, original), fields(message_id = %original.id))]
    async fn process_message(&self, original: Message) {
        self.metrics.incr_dispatched();

        // Recipients expanded transactionally before anything else.
        if let Err(e) = self.tracker.process_message_recipients(&original).await {
            warn!(error = %e, "recipient expansion failed");
            self.fail_message(&original, &[], &format!("recipient expansion failed: {e}"), None)
                .await;
            return;
        }

        // Suppressed recipients (unsubscribed, bounce-suppressed) never
        // appear in the outbound envelope; their junction rows also stay
        // out of every later outcome update.
        let deliverable = match self.tracker.deliverable_recipients(&original).await {
            Ok(d) => d,
            Err(e) => {
                self.fail_message(&original, &[], &format!("recipient lookup failed: {e}"), None)
                    .await;
                return;
            }
        };
        let mut message = original.clone();
        let keep = |addr: &String| deliverable.contains(&normalize_email(addr));
        message.to.retain(keep);
        message.cc.retain(keep);
        message.bcc.retain(keep);
        if message.all_recipients().next().is_none() {
            self.metrics.incr_validation_failures();
            self.fail_message(&original, &[], "no deliverable recipients remain", None)
                .await;
            return;
        }

        // Variables substituted; unresolved markers are fatal.
        self.variables.substitute(&mut message).await;
        if let Err(e) = validate_resolved(&message) {
            self.metrics.incr_validation_failures();
            self.fail_message(&original, &deliverable, &e.to_string(), Some(DeliveryStatus::Failed))
                .await;
            return;
        }

        // Optional personalization; discarded if it invalidates the
        // message.
        if let Some(transformer) = &self.transformer {
            match transformer.transform(&message).await {
                Ok(candidate)
                    if validate_resolved(&candidate).is_ok()
                        && candidate.all_recipients().next().is_some() =>
                {
                    message = candidate;
                }
                Ok(_) => {
                    warn!("personalization produced an invalid message, keeping original");
                }
                Err(e) => {
                    warn!(error = %e, "personalization failed, keeping original");
                }
            }
        }

        // Route.
        let primary = match self.manager.select_gateway(&message.from) {
            Ok(gateway) => gateway,
            Err(e) => {
                self.metrics.incr_routing_failures();
                self.fail_message(&original, &deliverable, &e.to_string(), Some(DeliveryStatus::Failed))
                    .await;
                return;
            }
        };

        // Admit. Denial returns the message to the queue without
        // consuming retry budget.
        let sender = normalize_email(&message.from);
        let decision = self.manager.limiter().check(primary.id(), &sender);
        if !decision.allowed {
            self.metrics.incr_rate_limited();
            let reason = decision
                .reason
                .map_or_else(|| "rate limited".to_owned(), |s| format!("rate limited ({s})"));
            self.defer_message(&original, &reason, decision.retry_after_seconds)
                .await;
            return;
        }

        self.send_with_failover(&original, &message, &deliverable, primary, &sender)
            .await;
    }

    /// Try the primary gateway, then its health-gated failover peers,
    /// each behind its circuit breaker. Failover is one logical attempt:
    /// the retry budget is consumed at most once per tick, by the final
    /// outcome.
    async fn send_with_failover(
        &self,
        original: &Message,
        message: &Message,
        recipients: &[String],
        primary: Arc<dyn DynGateway>,
        sender: &str,
    ) {
        let mut chain = vec![Arc::clone(&primary)];
        chain.extend(self.manager.failover_chain(primary.id(), sender));

        let mut last_error: Option<(Arc<dyn DynGateway>, DispatchError)> = None;

        for (attempt, gateway) in chain.into_iter().enumerate() {
            // Failover candidates pass the same admission gate.
            if attempt > 0 && !self.manager.limiter().check(gateway.id(), sender).allowed {
                debug!(gateway = %gateway.id(), "failover candidate rate limited, skipping");
                continue;
            }

            let breaker = self.manager.breakers().breaker(gateway.id());
            if let Err(e) = breaker.try_acquire() {
                self.metrics.incr_circuit_open();
                debug!(gateway = %gateway.id(), "circuit open, skipping");
                last_error = Some((gateway, e));
                continue;
            }

            match tokio::time::timeout(self.config.send_timeout, gateway.send(message)).await {
                Ok(Ok(receipt)) => {
                    breaker.record_success();
                    if attempt > 0 {
                        self.metrics.incr_failovers();
                    }
                    let provider_message_id = receipt.provider_message_id.clone();
                    self.finalize_success(original, recipients, gateway.as_ref(), provider_message_id)
                        .await;
                    return;
                }
                Ok(Err(send_error)) => {
                    breaker.record_failure();
                    warn!(gateway = %gateway.id(), error = %send_error, "send failed");
                    let terminal = matches!(
                        send_error,
                        SendError::Bounce(_) | SendError::InvalidMessage(_) | SendError::Permanent(_)
                    );
                    last_error = Some((gateway, DispatchError::Send(send_error)));
                    if terminal {
                        break;
                    }
                }
                Err(_) => {
                    breaker.record_failure();
                    warn!(gateway = %gateway.id(), "send timed out");
                    last_error = Some((
                        gateway,
                        DispatchError::Send(SendError::Timeout(self.config.send_timeout)),
                    ));
                }
            }
        }

        match last_error {
            Some((gateway, DispatchError::Send(error))) => {
                self.finalize_failure(original, recipients, gateway.as_ref(), &error)
                    .await;
            }
            Some((_, DispatchError::CircuitOpen { gateway })) => {
                // Every candidate was breaker-gated: retriable, so the
                // message goes back to the queue without consuming budget.
                self.defer_message(original, &format!("circuit open on {gateway}"), None)
                    .await;
            }
            Some((gateway, other)) => {
                self.finalize_failure(
                    original,
                    recipients,
                    gateway.as_ref(),
                    &SendError::Transient(other.to_string()),
                )
                .await;
            }
            None => {
                self.defer_message(original, "no sendable gateway in chain", None)
                    .await;
            }
        }
    }

    async fn finalize_success(
        &self,
        original: &Message,
        recipients: &[String],
        gateway: &dyn DynGateway,
        provider_message_id: Option<String>,
    ) {
        if let Err(e) = self
            .queue
            .update_status_with_gateway(original.id, MessageStatus::Sent, gateway.id(), None)
            .await
        {
            error!(error = %e, "failed to record sent status");
        }
        self.manager
            .limiter()
            .record_send(gateway.id(), &normalize_email(&original.from));
        if let Err(e) = self
            .tracker
            .record_dispatch_outcome(
                original.id,
                recipients,
                DeliveryStatus::Sent,
                Some(gateway.id()),
                Some(gateway.kind().as_str()),
                None,
            )
            .await
        {
            error!(error = %e, "failed to record recipient outcome");
        }
        self.metrics.incr_sent();
        let mut event =
            DeliveryEvent::new(original.id, DeliveryEventKind::Send).with_gateway(gateway.id());
        if let Some(pid) = provider_message_id {
            event = event.with_detail(pid);
        }
        self.events.emit(event).await;
        debug!(gateway = %gateway.id(), "message sent");
    }

    async fn finalize_failure(
        &self,
        original: &Message,
        recipients: &[String],
        gateway: &dyn DynGateway,
        error: &SendError,
    ) {
        let class = error.failure_class();
        let status = class.message_status();
        let delivery = class.delivery_status();

        match status {
            MessageStatus::AuthError => self.metrics.incr_auth_errors(),
            _ => self.metrics.incr_failed(),
        }

        if let Err(e) = self
            .queue
            .update_status_with_gateway(original.id, status, gateway.id(), Some(&error.to_string()))
            .await
        {
            error!(error = %e, "failed to record failure status");
        }

        let bounce_reason = (delivery == DeliveryStatus::Bounced).then(|| error.to_string());
        if let Err(e) = self
            .tracker
            .record_dispatch_outcome(
                original.id,
                recipients,
                delivery,
                Some(gateway.id()),
                Some(gateway.kind().as_str()),
                bounce_reason.as_deref(),
            )
            .await
        {
            error!(error = %e, "failed to record recipient outcome");
        }

        let kind = match delivery {
            DeliveryStatus::Deferred => DeliveryEventKind::Defer,
            DeliveryStatus::Bounced => DeliveryEventKind::Bounce,
            _ => DeliveryEventKind::Reject,
        };
        self.events
            .emit(
                DeliveryEvent::new(original.id, kind)
                    .with_gateway(gateway.id())
                    .with_detail(error.to_string()),
            )
            .await;
    }

    /// Non-send failure (validation, routing, storage): the message fails
    /// and consumes a retry attempt; only the given recipients are
    /// marked, and only when a delivery status is given.
    async fn fail_message(
        &self,
        original: &Message,
        recipients: &[String],
        reason: &str,
        delivery: Option<DeliveryStatus>,
    ) {
        self.metrics.incr_failed();
        if let Err(e) = self
            .queue
            .update_status(original.id, MessageStatus::Failed, Some(reason))
            .await
        {
            error!(error = %e, "failed to record failed status");
        }
        if let Some(delivery) = delivery
            && let Err(e) = self
                .tracker
                .record_dispatch_outcome(original.id, recipients, delivery, None, None, None)
                .await
        {
            error!(error = %e, "failed to record recipient outcome");
        }
        self.events
            .emit(DeliveryEvent::new(original.id, DeliveryEventKind::Reject).with_detail(reason))
            .await;
    }

    /// Retriable denial (rate limit, open breakers): back to `queued`
    /// without touching the retry budget.
    async fn defer_message(&self, original: &Message, reason: &str, retry_after: Option<u64>) {
        self.metrics.incr_deferred();
        if let Err(e) = self.queue.mark_queued(original.id).await {
            error!(error = %e, "failed to requeue deferred message");
        }
        let mut event =
            DeliveryEvent::new(original.id, DeliveryEventKind::Defer).with_detail(reason);
        if let Some(seconds) = retry_after {
            event = event.with_retry_after(seconds);
        }
        self.events.emit(event).await;
        debug!(reason, "message deferred");
    }
}
