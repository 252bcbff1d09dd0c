use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request body for `POST /messages/send.json`.
#[derive(Debug, Clone, Serialize)]
pub struct MandrillSendRequest {
    pub key: String,
    pub message: MandrillMessage,
}

/// The message object inside a send request.
#[derive(Debug, Clone, Serialize)]
pub struct MandrillMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub subject: String,
    pub from_email: String,
    pub to: Vec<MandrillRecipient>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub track_opens: bool,
    pub track_clicks: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// One envelope slot in a Mandrill send request.
#[derive(Debug, Clone, Serialize)]
pub struct MandrillRecipient {
    pub email: String,
    /// `"to"`, `"cc"`, or `"bcc"`.
    #[serde(rename = "type")]
    pub recipient_type: String,
}

/// Per-recipient entry in a send response array.
#[derive(Debug, Clone, Deserialize)]
pub struct MandrillSendResult {
    pub email: String,
    /// `sent`, `queued`, `scheduled`, `rejected`, or `invalid`.
    pub status: String,
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

/// Error envelope Mandrill returns instead of a result array.
#[derive(Debug, Clone, Deserialize)]
pub struct MandrillApiError {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One entry of a Mandrill webhook batch (the `mandrill_events` form
/// field decodes to an array of these).
#[derive(Debug, Clone, Deserialize)]
pub struct MandrillWebhookEvent {
    /// Native event name: `send`, `open`, `click`, `hard_bounce`,
    /// `soft_bounce`, `reject`, `spam`, `unsub`, `deferral`.
    pub event: String,
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    /// Unix timestamp of the event.
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default)]
    pub msg: Option<MandrillWebhookMsg>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Clicked URL, for click events.
    #[serde(default)]
    pub url: Option<String>,
}

/// The `msg` object embedded in a webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct MandrillWebhookMsg {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub email: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub opens: Option<i64>,
    #[serde(default)]
    pub clicks: Option<i64>,
    /// Courier stamps the queue message id in here on send.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub bounce_description: Option<String>,
    #[serde(default)]
    pub diag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_skips_empty_fields() {
        let req = MandrillSendRequest {
            key: "k".into(),
            message: MandrillMessage {
                html: None,
                text: Some("hello".into()),
                subject: "s".into(),
                from_email: "a@x.com".into(),
                to: vec![MandrillRecipient {
                    email: "b@y.com".into(),
                    recipient_type: "to".into(),
                }],
                headers: HashMap::new(),
                track_opens: true,
                track_clicks: false,
                metadata: HashMap::new(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["message"].get("html").is_none());
        assert!(json["message"].get("headers").is_none());
        assert_eq!(json["message"]["to"][0]["type"], "to");
    }

    #[test]
    fn parses_send_results() {
        let body = r#"[
            {"email":"a@x.com","status":"sent","_id":"abc"},
            {"email":"b@x.com","status":"rejected","reject_reason":"hard-bounce"}
        ]"#;
        let results: Vec<MandrillSendResult> = serde_json::from_str(body).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, "sent");
        assert_eq!(results[1].reject_reason.as_deref(), Some("hard-bounce"));
    }

    #[test]
    fn parses_api_error() {
        let body = r#"{"status":"error","code":-1,"name":"Invalid_Key","message":"Invalid API key"}"#;
        let err: MandrillApiError = serde_json::from_str(body).unwrap();
        assert_eq!(err.name.as_deref(), Some("Invalid_Key"));
    }

    #[test]
    fn parses_webhook_event() {
        let body = r#"[{
            "event": "hard_bounce",
            "_id": "evt1",
            "ts": 1770000000,
            "msg": {
                "_id": "msg1",
                "email": "r@x.com",
                "state": "bounced",
                "sender": "a@mail.example.com",
                "bounce_description": "user unknown",
                "metadata": {"message_id": "11111111-2222-3333-4444-555555555555"}
            }
        }]"#;
        let events: Vec<MandrillWebhookEvent> = serde_json::from_str(body).unwrap();
        assert_eq!(events[0].event, "hard_bounce");
        let msg = events[0].msg.as_ref().unwrap();
        assert_eq!(msg.email, "r@x.com");
        assert_eq!(
            msg.metadata.get("message_id").map(String::as_str),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }
}
