use std::collections::HashMap;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_core::{DeliveryStatus, EngagementKind};
use courier_mandrill::MandrillWebhookEvent;

use crate::state::AppState;

use super::{client_ip, user_agent};

/// What a provider callback translates to on the tracking engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    Delivery(DeliveryStatus),
    Engagement(EngagementKind),
    /// Bounce callbacks update delivery state and log the event.
    DeliveryAndEvent(DeliveryStatus, EngagementKind),
    Ignore,
}

/// Map a Mandrill-native event name to the canonical action.
#[must_use]
pub fn map_mandrill_event(event: &str) -> WebhookAction {
    match event {
        "send" => WebhookAction::Delivery(DeliveryStatus::Sent),
        "open" => WebhookAction::Engagement(EngagementKind::Open),
        "click" => WebhookAction::Engagement(EngagementKind::Click),
        "hard_bounce" | "soft_bounce" => {
            WebhookAction::DeliveryAndEvent(DeliveryStatus::Bounced, EngagementKind::Bounce)
        }
        "reject" => WebhookAction::Delivery(DeliveryStatus::Failed),
        "spam" => WebhookAction::Engagement(EngagementKind::Complaint),
        "unsub" => WebhookAction::Engagement(EngagementKind::Unsubscribe),
        "deferral" => WebhookAction::Delivery(DeliveryStatus::Deferred),
        _ => WebhookAction::Ignore,
    }
}

/// Map a Mailgun-native event name (plus failure severity) to the
/// canonical action.
#[must_use]
pub fn map_mailgun_event(event: &str, severity: Option<&str>) -> WebhookAction {
    match event {
        "delivered" => WebhookAction::Delivery(DeliveryStatus::Sent),
        "opened" => WebhookAction::Engagement(EngagementKind::Open),
        "clicked" => WebhookAction::Engagement(EngagementKind::Click),
        "failed" if severity == Some("permanent") => {
            WebhookAction::DeliveryAndEvent(DeliveryStatus::Bounced, EngagementKind::Bounce)
        }
        "failed" => WebhookAction::Delivery(DeliveryStatus::Deferred),
        "complained" => WebhookAction::Engagement(EngagementKind::Complaint),
        "unsubscribed" => WebhookAction::Engagement(EngagementKind::Unsubscribe),
        _ => WebhookAction::Ignore,
    }
}

async fn apply_action(
    state: &AppState,
    action: WebhookAction,
    message_id: Uuid,
    email: &str,
    reason: Option<&str>,
    data: serde_json::Value,
    ip: Option<&str>,
    ua: Option<&str>,
) {
    let result = match action {
        WebhookAction::Delivery(status) => {
            state
                .tracker
                .update_delivery_status(message_id, email, status, reason)
                .await
        }
        WebhookAction::Engagement(kind) => {
            state
                .tracker
                .record_engagement(message_id, email, kind, data, ip, ua)
                .await
        }
        WebhookAction::DeliveryAndEvent(status, kind) => {
            let first = state
                .tracker
                .update_delivery_status(message_id, email, status, reason)
                .await;
            let second = state
                .tracker
                .record_engagement(message_id, email, kind, data, ip, ua)
                .await;
            first.and(second)
        }
        WebhookAction::Ignore => Ok(()),
    };
    if let Err(e) = result {
        // Recording failures never surface to the provider.
        warn!(message_id = %message_id, email, error = %e, "webhook recording failed");
    }
}

#[derive(Debug, Deserialize)]
struct MandrillForm {
    mandrill_events: String,
}

/// `POST /webhook/mandrill` -- Mandrill event batches, either as the
/// documented `mandrill_events` form field or a raw JSON array.
pub async fn mandrill(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let payload = if headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
    {
        body
    } else {
        match serde_urlencoded::from_str::<MandrillForm>(&body) {
            Ok(form) => form.mandrill_events,
            Err(e) => {
                warn!(error = %e, "unparseable mandrill webhook form");
                return (StatusCode::OK, "ok");
            }
        }
    };

    let events: Vec<MandrillWebhookEvent> = match serde_json::from_str(&payload) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "unparseable mandrill webhook payload");
            return (StatusCode::OK, "ok");
        }
    };

    let ip = client_ip(&headers);
    let ua = user_agent(&headers);
    for event in events {
        let Some(msg) = event.msg else {
            continue;
        };
        let Some(message_id) = msg
            .metadata
            .get("message_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        else {
            debug!(event = %event.event, email = %msg.email, "mandrill event without message_id");
            continue;
        };
        let reason = msg
            .bounce_description
            .clone()
            .or_else(|| msg.diag.clone());
        let data = serde_json::json!({
            "provider": "mandrill",
            "event": event.event,
            "ts": event.ts,
            "url": event.url,
        });
        let action = map_mandrill_event(&event.event);
        apply_action(
            &state,
            action,
            message_id,
            &msg.email,
            reason.as_deref(),
            data,
            event.ip.as_deref().or(ip.as_deref()),
            event.user_agent.as_deref().or(ua.as_deref()),
        )
        .await;
    }

    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
pub struct MailgunWebhook {
    #[serde(rename = "event-data")]
    pub event_data: MailgunEventData,
}

#[derive(Debug, Deserialize)]
pub struct MailgunEventData {
    pub event: String,
    pub recipient: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "client-info", default)]
    pub client_info: Option<MailgunClientInfo>,
    #[serde(rename = "user-variables", default)]
    pub user_variables: HashMap<String, String>,
    #[serde(rename = "delivery-status", default)]
    pub delivery_status: Option<MailgunDeliveryStatus>,
}

#[derive(Debug, Deserialize)]
pub struct MailgunClientInfo {
    #[serde(rename = "user-agent", default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MailgunDeliveryStatus {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `POST /webhook/mailgun` -- Mailgun event payloads.
pub async fn mailgun(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(webhook): Json<MailgunWebhook>,
) -> impl IntoResponse {
    let event = webhook.event_data;
    let Some(message_id) = event
        .user_variables
        .get("message_id")
        .and_then(|v| Uuid::parse_str(v).ok())
    else {
        debug!(event = %event.event, recipient = %event.recipient, "mailgun event without message_id");
        return (StatusCode::OK, Json(serde_json::json!({"message": "ok"})));
    };

    let reason = event.reason.clone().or_else(|| {
        event
            .delivery_status
            .as_ref()
            .and_then(|d| d.message.clone().or_else(|| d.description.clone()))
    });
    let data = serde_json::json!({
        "provider": "mailgun",
        "event": event.event,
        "url": event.url,
    });
    let action = map_mailgun_event(&event.event, event.severity.as_deref());
    let header_ip = client_ip(&headers);
    let header_ua = user_agent(&headers);
    let ua = event
        .client_info
        .as_ref()
        .and_then(|c| c.user_agent.clone())
        .or(header_ua);

    apply_action(
        &state,
        action,
        message_id,
        &event.recipient,
        reason.as_deref(),
        data,
        event.ip.as_deref().or(header_ip.as_deref()),
        ua.as_deref(),
    )
    .await;

    (StatusCode::OK, Json(serde_json::json!({"message": "ok"})))
}
