use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider-assigned message id, when the provider returns one.
    #[serde(default)]
    pub provider_message_id: Option<String>,
    /// When the provider acknowledged the message.
    pub accepted_at: DateTime<Utc>,
    /// Raw provider response payload, for diagnostics.
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl SendReceipt {
    /// Receipt with a provider message id.
    #[must_use]
    pub fn accepted(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: Some(provider_message_id.into()),
            accepted_at: Utc::now(),
            detail: serde_json::Value::Null,
        }
    }

    /// Receipt from a provider that returns no message id.
    #[must_use]
    pub fn accepted_anonymous() -> Self {
        Self {
            provider_message_id: None,
            accepted_at: Utc::now(),
            detail: serde_json::Value::Null,
        }
    }

    /// Attach the raw provider response.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Wire-format capabilities of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFeatures {
    /// File attachments.
    pub attachments: bool,
    /// Provider-side open/click tracking.
    pub tracking: bool,
    /// Arbitrary custom headers.
    pub custom_headers: bool,
}
