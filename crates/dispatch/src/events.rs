use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use courier_core::DeliveryEventKind;

/// A delivery lifecycle notification emitted by the processor.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub message_id: Uuid,
    pub kind: DeliveryEventKind,
    pub gateway_id: Option<String>,
    pub detail: Option<String>,
    /// Advisory wait for defer events.
    pub retry_after_seconds: Option<u64>,
}

impl DeliveryEvent {
    #[must_use]
    pub fn new(message_id: Uuid, kind: DeliveryEventKind) -> Self {
        Self {
            message_id,
            kind,
            gateway_id: None,
            detail: None,
            retry_after_seconds: None,
        }
    }

    #[must_use]
    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }
}

/// Receives the processor's send/defer/bounce/reject notifications.
#[async_trait]
pub trait DeliveryEvents: Send + Sync {
    async fn emit(&self, event: DeliveryEvent);
}

/// Default sink: structured log lines only.
pub struct LogDeliveryEvents;

#[async_trait]
impl DeliveryEvents for LogDeliveryEvents {
    async fn emit(&self, event: DeliveryEvent) {
        info!(
            message_id = %event.message_id,
            kind = %event.kind,
            gateway = event.gateway_id.as_deref().unwrap_or("-"),
            detail = event.detail.as_deref().unwrap_or(""),
            "delivery event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fields() {
        let event = DeliveryEvent::new(Uuid::new_v4(), DeliveryEventKind::Defer)
            .with_gateway("mg1")
            .with_detail("rate limited")
            .with_retry_after(600);
        assert_eq!(event.kind, DeliveryEventKind::Defer);
        assert_eq!(event.gateway_id.as_deref(), Some("mg1"));
        assert_eq!(event.retry_after_seconds, Some(600));
    }
}
