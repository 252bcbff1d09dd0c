use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument, warn};

use courier_core::{GatewayConfig, GatewayCredentials, GatewayKind, Message};
use courier_gateway::{Gateway, SendError, SendFeatures, SendReceipt, effective_headers};

use crate::types::{
    MandrillApiError, MandrillMessage, MandrillRecipient, MandrillSendRequest, MandrillSendResult,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// A delivery gateway speaking the Mandrill (Mailchimp Transactional) API.
pub struct MandrillGateway {
    config: GatewayConfig,
    api_key: String,
    base_url: String,
    client: Client,
}

impl std::fmt::Debug for MandrillGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MandrillGateway")
            .field("id", &self.config.id)
            .field("domain", &self.config.domain)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl MandrillGateway {
    /// Build a Mandrill gateway from its configuration.
    pub fn new(config: GatewayConfig) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| SendError::Configuration(e.to_string()))?;
        Self::with_client(config, client)
    }

    /// Build a Mandrill gateway with a caller-supplied HTTP client.
    pub fn with_client(config: GatewayConfig, client: Client) -> Result<Self, SendError> {
        let GatewayCredentials::Mandrill { api_key, base_url } = &config.credentials else {
            return Err(SendError::Configuration(format!(
                "gateway {} does not carry mandrill credentials",
                config.id
            )));
        };
        if api_key.is_empty() {
            return Err(SendError::Configuration(format!(
                "gateway {} has an empty mandrill api key",
                config.id
            )));
        }
        let api_key = api_key.clone();
        let base_url = base_url.trim_end_matches('/').to_owned();
        Ok(Self {
            config,
            api_key,
            base_url,
            client,
        })
    }

    /// Build the JSON request for a message. The queue message id rides in
    /// `metadata.message_id` so webhook events can be correlated back.
    #[must_use]
    pub fn send_request(&self, message: &Message) -> MandrillSendRequest {
        let mut to = Vec::new();
        for addr in &message.to {
            to.push(MandrillRecipient {
                email: addr.clone(),
                recipient_type: "to".into(),
            });
        }
        for addr in &message.cc {
            to.push(MandrillRecipient {
                email: addr.clone(),
                recipient_type: "cc".into(),
            });
        }
        for addr in &message.bcc {
            to.push(MandrillRecipient {
                email: addr.clone(),
                recipient_type: "bcc".into(),
            });
        }

        let mut metadata = HashMap::new();
        metadata.insert("message_id".to_owned(), message.id.to_string());
        if let Some(campaign) = &message.campaign_id {
            metadata.insert("campaign_id".to_owned(), campaign.clone());
        }

        MandrillSendRequest {
            key: self.api_key.clone(),
            message: MandrillMessage {
                html: message.html.clone(),
                text: message.text.clone(),
                subject: message.subject.clone(),
                from_email: message.from.clone(),
                to,
                headers: effective_headers(&self.config, message),
                track_opens: self.config.tracking.track_opens,
                track_clicks: self.config.tracking.track_clicks,
                metadata,
            },
        }
    }

    /// Interpret the per-recipient result array. Any `rejected`/`invalid`
    /// entry fails the whole send; bounce-shaped reject reasons classify
    /// as bounces.
    fn interpret_results(results: &[MandrillSendResult]) -> Result<SendReceipt, SendError> {
        let Some(first) = results.first() else {
            return Err(SendError::Transient("empty mandrill response".into()));
        };

        for result in results {
            match result.status.as_str() {
                "sent" | "queued" | "scheduled" => {}
                "rejected" | "invalid" => {
                    let reason = result
                        .reject_reason
                        .clone()
                        .unwrap_or_else(|| result.status.clone());
                    return if reason.contains("bounce") || result.status == "invalid" {
                        Err(SendError::Bounce(format!(
                            "{} rejected: {reason}",
                            result.email
                        )))
                    } else {
                        Err(SendError::Permanent(format!(
                            "{} rejected: {reason}",
                            result.email
                        )))
                    };
                }
                other => {
                    return Err(SendError::Transient(format!(
                        "unexpected mandrill status {other} for {}",
                        result.email
                    )));
                }
            }
        }

        let mut receipt = match &first.id {
            Some(id) => SendReceipt::accepted(id.clone()),
            None => SendReceipt::accepted_anonymous(),
        };
        if let Ok(detail) = serde_json::to_value(
            results
                .iter()
                .map(|r| (r.email.clone(), r.status.clone()))
                .collect::<HashMap<_, _>>(),
        ) {
            receipt = receipt.with_detail(detail);
        }
        Ok(receipt)
    }

    fn map_api_error(err: &MandrillApiError) -> SendError {
        let message = err.message.clone().unwrap_or_default();
        match err.name.as_deref() {
            Some("Invalid_Key") => SendError::Auth(format!("invalid credentials: {message}")),
            Some("PaymentRequired") => SendError::Permanent(message),
            Some("ValidationError") => SendError::InvalidMessage(message),
            Some("GeneralError") | None => SendError::Transient(message),
            Some(other) => SendError::Permanent(format!("{other}: {message}")),
        }
    }

    fn map_transport(err: &reqwest::Error) -> SendError {
        if err.is_timeout() {
            SendError::Timeout(SEND_TIMEOUT)
        } else {
            SendError::Transient(err.to_string())
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, SendError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_transport(&e))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("invalid mandrill response: {e}")))?;

        // Mandrill reports API errors as a JSON object with status=error,
        // usually alongside a 500.
        if payload.get("status").and_then(|s| s.as_str()) == Some("error") {
            let api_error: MandrillApiError =
                serde_json::from_value(payload).unwrap_or(MandrillApiError {
                    status: Some("error".into()),
                    code: None,
                    name: None,
                    message: None,
                });
            return Err(Self::map_api_error(&api_error));
        }
        if !status.is_success() {
            return if status.is_server_error() {
                Err(SendError::Transient(format!("mandrill {status}")))
            } else {
                Err(SendError::Permanent(format!("mandrill {status}")))
            };
        }
        Ok(payload)
    }
}

impl Gateway for MandrillGateway {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Mandrill
    }

    fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, gateway = %self.config.id))]
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        let request = self.send_request(message);
        debug!(recipients = request.message.to.len(), "posting message to mandrill");

        let body = serde_json::to_value(&request)
            .map_err(|e| SendError::InvalidMessage(e.to_string()))?;
        let payload = self.post_json("messages/send.json", &body).await?;

        let results: Vec<MandrillSendResult> = serde_json::from_value(payload)
            .map_err(|e| SendError::Transient(format!("invalid mandrill response: {e}")))?;

        match Self::interpret_results(&results) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                warn!(error = %err, "mandrill send rejected");
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(gateway = %self.config.id))]
    async fn health_check(&self) -> Result<(), SendError> {
        let body = serde_json::json!({ "key": self.api_key });
        let payload = self.post_json("users/ping.json", &body).await?;
        if payload.as_str() == Some("PONG!") {
            Ok(())
        } else {
            Err(SendError::Transient(format!(
                "unexpected ping response: {payload}"
            )))
        }
    }

    fn features(&self) -> SendFeatures {
        SendFeatures {
            attachments: true,
            tracking: true,
            custom_headers: true,
        }
    }
}
