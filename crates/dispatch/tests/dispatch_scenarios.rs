//! End-to-end dispatch scenarios over the in-memory backends and a
//! scriptable gateway.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{
    DeliveryEventKind, DeliveryStatus, EngagementKind, GatewayConfig, GatewayCredentials,
    GatewayKind, GlobalRateLimits, Message, MessageStatus, RateLimitConfig,
};
use courier_dispatch::{
    BreakerConfig, DeliveryEvent, DeliveryEvents, GatewayManager, ProcessorConfig, QueueProcessor,
};
use courier_gateway::{DynGateway, SendError, SendReceipt};
use courier_store::{MemoryMessageQueue, MemoryRecipientTracker, MessageQueue, RecipientTracker};

// -- Scriptable gateway ---------------------------------------------------

#[derive(Clone, Copy)]
enum Outcome {
    Accept,
    AuthError,
    Bounce,
    ServerError,
}

struct ScriptedGateway {
    config: GatewayConfig,
    script: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<Message>>,
}

impl ScriptedGateway {
    fn new(id: &str, domain: &str) -> Arc<Self> {
        Arc::new(Self {
            config: GatewayConfig::new(
                id,
                domain,
                GatewayCredentials::Mailgun {
                    api_key: "key-test".into(),
                    base_url: "https://api.mailgun.net/v3".into(),
                },
            ),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn with_failover(id: &str, domain: &str, failover_to: &[&str]) -> Arc<Self> {
        let gateway = Self::new(id, domain);
        let mut config = gateway.config.clone();
        config.failover_to = failover_to.iter().map(|s| (*s).to_owned()).collect();
        Arc::new(Self {
            config,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn push_outcomes(&self, outcomes: &[Outcome]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn last_call(&self) -> Option<Message> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl DynGateway for ScriptedGateway {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Mailgun
    }

    fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        self.calls.lock().unwrap().push(message.clone());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Accept);
        match outcome {
            Outcome::Accept => Ok(SendReceipt::accepted(format!("prov-{}", message.id))),
            Outcome::AuthError => Err(SendError::Auth("401 unauthorized".into())),
            Outcome::Bounce => Err(SendError::Bounce("recipient does not exist".into())),
            Outcome::ServerError => Err(SendError::Transient("502 bad gateway".into())),
        }
    }

    async fn health_check(&self) -> Result<(), SendError> {
        Ok(())
    }
}

// -- Event collector ------------------------------------------------------

#[derive(Default)]
struct CollectingEvents(Mutex<Vec<DeliveryEvent>>);

impl CollectingEvents {
    fn kinds(&self) -> Vec<DeliveryEventKind> {
        self.0.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn find(&self, kind: DeliveryEventKind) -> Option<DeliveryEvent> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl DeliveryEvents for CollectingEvents {
    async fn emit(&self, event: DeliveryEvent) {
        self.0.lock().unwrap().push(event);
    }
}

// -- Harness --------------------------------------------------------------

struct Harness {
    queue: Arc<MemoryMessageQueue>,
    tracker: Arc<MemoryRecipientTracker>,
    manager: Arc<GatewayManager>,
    events: Arc<CollectingEvents>,
    processor: Arc<QueueProcessor>,
}

fn harness_with(breaker: BreakerConfig) -> Harness {
    let queue = Arc::new(MemoryMessageQueue::new());
    let tracker = Arc::new(MemoryRecipientTracker::new());
    let manager = Arc::new(GatewayManager::new(GlobalRateLimits::default(), breaker));
    let events = Arc::new(CollectingEvents::default());
    let config = ProcessorConfig {
        tick_interval: Duration::from_millis(10),
        batch_size: 10,
        max_workers: 1,
        send_timeout: Duration::from_secs(5),
    };
    let processor = Arc::new(
        QueueProcessor::new(
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            Arc::clone(&tracker) as Arc<dyn RecipientTracker>,
            Arc::clone(&manager),
            config,
        )
        .with_events(Arc::clone(&events) as Arc<dyn DeliveryEvents>),
    );
    Harness {
        queue,
        tracker,
        manager,
        events,
        processor,
    }
}

fn harness() -> Harness {
    harness_with(BreakerConfig::default())
}

fn simple_message() -> Message {
    Message::new("a@mail.example.com", vec!["x@y.com".into()])
        .with_subject("hi")
        .with_text("ok")
}

// -- happy path -----------------------------------------------------------

#[tokio::test]
async fn happy_path_sends_via_matching_gateway() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    h.manager.register(gw.clone());

    let msg = simple_message();
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();

    let processed = h.processor.tick().await.unwrap();
    assert_eq!(processed, 1);

    // Exactly one provider call with the submitted envelope.
    assert_eq!(gw.call_count(), 1);
    let sent = gw.last_call().unwrap();
    assert_eq!(sent.from, "a@mail.example.com");
    assert_eq!(sent.to, vec!["x@y.com".to_owned()]);
    assert_eq!(sent.subject, "hi");
    assert_eq!(sent.text.as_deref(), Some("ok"));

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.provider_id.as_deref(), Some("mg1"));
    assert!(stored.sent_at.is_some());

    let junction = h
        .tracker
        .get_message_recipient(id, "x@y.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(junction.delivery_status, DeliveryStatus::Sent);
    assert_eq!(junction.gateway_id.as_deref(), Some("mg1"));
    assert_eq!(junction.gateway_kind.as_deref(), Some("mailgun"));

    // The rate limiter recorded exactly one send for (mg1, sender).
    assert_eq!(h.manager.limiter().gateway_daily_count("mg1"), 1);
    assert_eq!(h.events.kinds(), vec![DeliveryEventKind::Send]);
}

// -- unresolved variables -------------------------------------------------

#[tokio::test]
async fn unresolved_variable_fails_without_provider_call() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    h.manager.register(gw.clone());

    let msg = Message::new("a@mail.example.com", vec!["x@y.com".into()])
        .with_subject("Check: <<TRENDING_QUESTION>>")
        .with_text("ok");
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();
    h.processor.tick().await.unwrap();

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("TRENDING_QUESTION"));
    assert_eq!(gw.call_count(), 0, "no provider call may happen");
    assert_eq!(h.events.kinds(), vec![DeliveryEventKind::Reject]);
}

// -- rate limit defer -----------------------------------------------------

#[tokio::test]
async fn rate_limit_defers_without_consuming_budget() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    h.manager.register(gw.clone());
    h.manager.limiter().set_config(
        "mg1",
        RateLimitConfig {
            per_user_daily: Some(1),
            ..RateLimitConfig::default()
        },
    );

    // Counter already at the daily limit.
    h.manager.limiter().record_send("mg1", "a@mail.example.com");

    let msg = simple_message();
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();
    h.processor.tick().await.unwrap();

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Queued, "message re-queued");
    assert_eq!(stored.retry_count, 0, "retry budget untouched");
    assert_eq!(gw.call_count(), 0);

    let defer = h.events.find(DeliveryEventKind::Defer).unwrap();
    let retry_after = defer.retry_after_seconds.unwrap();
    assert!(retry_after > 0 && retry_after <= 24 * 3600);
}

// -- auth error failover --------------------------------------------------

#[tokio::test]
async fn auth_error_fails_over_within_same_tick() {
    let h = harness();
    let primary = ScriptedGateway::with_failover("primary", "mail.example.com", &["secondary"]);
    primary.push_outcomes(&[Outcome::AuthError]);

    let secondary = ScriptedGateway::new("secondary", "backup.example.com");
    h.manager.register(primary.clone());
    h.manager.register(secondary.clone());

    let msg = simple_message();
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();
    h.processor.tick().await.unwrap();

    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 1, "failover within the same tick");

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.provider_id.as_deref(), Some("secondary"));
    // One logical attempt: the budget was consumed once, by the outcome.
    assert_eq!(stored.retry_count, 1);
}

// -- circuit trip ---------------------------------------------------------

#[tokio::test]
async fn circuit_trips_after_threshold() {
    let h = harness_with(BreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_secs(3600),
        max_requests: 1,
    });
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    gw.push_outcomes(&[
        Outcome::ServerError,
        Outcome::ServerError,
        Outcome::ServerError,
        Outcome::ServerError,
        Outcome::ServerError,
    ]);
    h.manager.register(gw.clone());

    let mut ids = Vec::new();
    for i in 0..5 {
        let msg = Message::new("a@mail.example.com", vec![format!("r{i}@y.com")])
            .with_subject("s")
            .with_text("t");
        ids.push(msg.id);
        h.queue.enqueue(msg).await.unwrap();
    }
    h.processor.tick().await.unwrap();

    // Calls 1-3 reach the provider; 4-5 are rejected by the open breaker.
    assert_eq!(gw.call_count(), 3);

    let mut failed = 0;
    let mut queued = 0;
    for id in ids {
        match h.queue.get(id).await.unwrap().unwrap().status {
            MessageStatus::Failed => failed += 1,
            MessageStatus::Queued => queued += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(failed, 3);
    assert_eq!(queued, 2, "breaker-gated messages return to the queue");
}

// -- Retry budget ---------------------------------------------------------

#[tokio::test]
async fn retry_budget_pins_message_failed_after_three_attempts() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    gw.push_outcomes(&[
        Outcome::ServerError,
        Outcome::ServerError,
        Outcome::ServerError,
        Outcome::ServerError,
    ]);
    h.manager.register(gw.clone());

    let msg = simple_message();
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();

    for _ in 0..5 {
        h.processor.tick().await.unwrap();
    }

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(stored.retry_count, 3, "budget capped at three attempts");
    assert_eq!(gw.call_count(), 3);
}

// -- Bounce classification ------------------------------------------------

#[tokio::test]
async fn synchronous_bounce_marks_recipient_and_skips_failover() {
    let h = harness();
    let primary = ScriptedGateway::with_failover("primary", "mail.example.com", &["secondary"]);
    primary.push_outcomes(&[Outcome::Bounce]);
    let secondary = ScriptedGateway::new("secondary", "backup.example.com");
    h.manager.register(primary.clone());
    h.manager.register(secondary.clone());

    let msg = simple_message();
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();
    h.processor.tick().await.unwrap();

    assert_eq!(secondary.call_count(), 0, "bounces do not fail over");

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);

    let junction = h
        .tracker
        .get_message_recipient(id, "x@y.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(junction.delivery_status, DeliveryStatus::Bounced);
    assert!(h.events.find(DeliveryEventKind::Bounce).is_some());
}

// -- Unsubscribe finality --------------------------------------------------

#[tokio::test]
async fn unsubscribed_recipient_is_never_sent_again() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    h.manager.register(gw.clone());

    // First message delivers and the recipient unsubscribes.
    let first = simple_message();
    h.queue.enqueue(first.clone()).await.unwrap();
    h.processor.tick().await.unwrap();
    assert_eq!(gw.call_count(), 1);
    h.tracker
        .record_engagement(
            first.id,
            "x@y.com",
            EngagementKind::Unsubscribe,
            serde_json::Value::Null,
            None,
            None,
        )
        .await
        .unwrap();

    // A later message to the same recipient must not reach the gateway.
    let second = simple_message();
    let second_id = second.id;
    h.queue.enqueue(second).await.unwrap();
    h.processor.tick().await.unwrap();

    assert_eq!(gw.call_count(), 1, "no further provider call");
    let stored = h.queue.get(second_id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
}

#[tokio::test]
async fn unsubscribed_recipient_never_acquires_sent_on_multi_recipient_send() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    h.manager.register(gw.clone());

    // First send delivers to the recipient who then unsubscribes.
    let first = Message::new("a@mail.example.com", vec!["gone@y.com".into()])
        .with_subject("s")
        .with_text("t");
    h.queue.enqueue(first.clone()).await.unwrap();
    h.processor.tick().await.unwrap();
    h.tracker
        .record_engagement(
            first.id,
            "gone@y.com",
            EngagementKind::Unsubscribe,
            serde_json::Value::Null,
            None,
            None,
        )
        .await
        .unwrap();

    // A later message addresses both the unsubscribed recipient and a
    // deliverable one; the send succeeds for the deliverable recipient.
    let second = Message::new(
        "a@mail.example.com",
        vec!["gone@y.com".into(), "keep@y.com".into()],
    )
    .with_subject("s")
    .with_text("t");
    let second_id = second.id;
    h.queue.enqueue(second).await.unwrap();
    h.processor.tick().await.unwrap();

    let stored = h.queue.get(second_id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);

    // The unsubscribed recipient left the outbound envelope.
    let sent = gw.last_call().unwrap();
    assert_eq!(sent.to, vec!["keep@y.com".to_owned()]);

    let kept = h
        .tracker
        .get_message_recipient(second_id, "keep@y.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.delivery_status, DeliveryStatus::Sent);

    // Their junction row stays pending: no `sent` is ever produced for
    // an unsubscribed (workspace, email).
    let suppressed = h
        .tracker
        .get_message_recipient(second_id, "gone@y.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(suppressed.delivery_status, DeliveryStatus::Pending);
    assert_eq!(suppressed.send_attempt_count, 0);
    assert!(suppressed.sent_at.is_none());
}

// -- Auth error without failover -------------------------------------------

#[tokio::test]
async fn auth_error_without_failover_defers_recipients() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    gw.push_outcomes(&[Outcome::AuthError]);
    h.manager.register(gw.clone());

    let msg = simple_message();
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();
    h.processor.tick().await.unwrap();

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::AuthError);

    let junction = h
        .tracker
        .get_message_recipient(id, "x@y.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(junction.delivery_status, DeliveryStatus::Deferred);
    assert!(h.events.find(DeliveryEventKind::Defer).is_some());
}

// -- Routing failure -------------------------------------------------------

#[tokio::test]
async fn unroutable_sender_fails_with_reject() {
    let h = harness();
    let gw = ScriptedGateway::new("mg1", "mail.example.com");
    h.manager.register(gw.clone());

    let msg = Message::new("a@stranger.org", vec!["x@y.com".into()])
        .with_subject("s")
        .with_text("t");
    let id = msg.id;
    h.queue.enqueue(msg).await.unwrap();
    h.processor.tick().await.unwrap();

    let stored = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert!(stored.error.as_deref().unwrap().contains("no_gateway_available"));
    assert_eq!(gw.call_count(), 0);
    assert!(h.events.find(DeliveryEventKind::Reject).is_some());
}
