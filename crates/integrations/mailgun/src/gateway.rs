use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use courier_core::{GatewayConfig, GatewayCredentials, GatewayKind, Message};
use courier_gateway::{Gateway, SendError, SendFeatures, SendReceipt, effective_headers};

use crate::types::{MailgunErrorResponse, MailgunSendResponse};

/// Default per-request timeout for sends.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// A delivery gateway speaking the Mailgun HTTP API.
///
/// Messages are posted form-encoded to `{base_url}/{domain}/messages` with
/// HTTP Basic auth (user `api`).
pub struct MailgunGateway {
    config: GatewayConfig,
    api_key: String,
    base_url: String,
    client: Client,
}

impl std::fmt::Debug for MailgunGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailgunGateway")
            .field("id", &self.config.id)
            .field("domain", &self.config.domain)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl MailgunGateway {
    /// Build a Mailgun gateway from its configuration.
    ///
    /// Returns [`SendError::Configuration`] when the credentials are not
    /// Mailgun credentials or the HTTP client cannot be constructed.
    pub fn new(config: GatewayConfig) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| SendError::Configuration(e.to_string()))?;
        Self::with_client(config, client)
    }

    /// Build a Mailgun gateway with a caller-supplied HTTP client.
    pub fn with_client(config: GatewayConfig, client: Client) -> Result<Self, SendError> {
        let GatewayCredentials::Mailgun { api_key, base_url } = &config.credentials else {
            return Err(SendError::Configuration(format!(
                "gateway {} does not carry mailgun credentials",
                config.id
            )));
        };
        if api_key.is_empty() {
            return Err(SendError::Configuration(format!(
                "gateway {} has an empty mailgun api key",
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

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.base_url, self.config.domain)
    }

    /// Build the form fields for a message, in the order Mailgun documents
    /// them. Tracking toggles and rewritten headers ride along as `o:` and
    /// `h:` fields.
    #[must_use]
    pub fn form_fields(&self, message: &Message) -> Vec<(String, String)> {
        let mut fields = vec![
            ("from".to_owned(), message.from.clone()),
            ("to".to_owned(), message.to.join(",")),
        ];
        if !message.cc.is_empty() {
            fields.push(("cc".to_owned(), message.cc.join(",")));
        }
        if !message.bcc.is_empty() {
            fields.push(("bcc".to_owned(), message.bcc.join(",")));
        }
        fields.push(("subject".to_owned(), message.subject.clone()));
        if let Some(html) = &message.html {
            fields.push(("html".to_owned(), html.clone()));
        }
        if let Some(text) = &message.text {
            fields.push(("text".to_owned(), text.clone()));
        }
        if self.config.tracking.track_opens {
            fields.push(("o:tracking-opens".to_owned(), "yes".to_owned()));
        }
        if self.config.tracking.track_clicks {
            fields.push(("o:tracking-clicks".to_owned(), "yes".to_owned()));
        }
        if self.config.tracking.track_unsubscribes {
            fields.push(("o:tracking-unsubscribe".to_owned(), "yes".to_owned()));
        }
        let mut headers: Vec<_> = effective_headers(&self.config, message).into_iter().collect();
        headers.sort();
        for (name, value) in headers {
            fields.push((format!("h:{name}"), value));
        }
        // The queue message id rides along as a user variable so webhook
        // events can be correlated back.
        fields.push(("v:message_id".to_owned(), message.id.to_string()));
        if let Some(campaign) = &message.campaign_id {
            fields.push(("v:campaign_id".to_owned(), campaign.clone()));
        }
        if let Some(invitation) = &message.invitation_id {
            fields.push(("v:invitation_id".to_owned(), invitation.clone()));
        }
        fields
    }

    /// Map a non-success HTTP response to a [`SendError`].
    fn map_failure(status: StatusCode, body: &str) -> SendError {
        let detail = serde_json::from_str::<MailgunErrorResponse>(body)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| body.to_owned());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SendError::Auth(format!("mailgun rejected credentials: {detail}"))
            }
            StatusCode::TOO_MANY_REQUESTS => SendError::RateLimited { retry_after: None },
            StatusCode::BAD_REQUEST if detail.to_ascii_lowercase().contains("not a valid address") => {
                SendError::Bounce(format!("invalid email: {detail}"))
            }
            s if s.is_server_error() => SendError::Transient(format!("mailgun {s}: {detail}")),
            s => SendError::Permanent(format!("mailgun {s}: {detail}")),
        }
    }

    fn map_transport(err: &reqwest::Error) -> SendError {
        if err.is_timeout() {
            SendError::Timeout(SEND_TIMEOUT)
        } else {
            SendError::Transient(err.to_string())
        }
    }
}

impl Gateway for MailgunGateway {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Mailgun
    }

    fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, gateway = %self.config.id))]
    async fn send(&self, message: &Message) -> Result<SendReceipt, SendError> {
        let url = self.messages_url();
        let fields = self.form_fields(message);

        debug!(to = %message.to.join(","), "posting message to mailgun");

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(&self.api_key))
            .form(&fields)
            .send()
            .await
            .map_err(|e| Self::map_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "mailgun send failed");
            return Err(Self::map_failure(status, &body));
        }

        let parsed: MailgunSendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("invalid mailgun response: {e}")))?;

        let mut receipt = match parsed.id {
            Some(ref id) => SendReceipt::accepted(id.clone()),
            None => SendReceipt::accepted_anonymous(),
        };
        if let Some(msg) = parsed.message {
            receipt = receipt.with_detail(serde_json::json!({ "message": msg }));
        }
        Ok(receipt)
    }

    #[instrument(skip(self), fields(gateway = %self.config.id))]
    async fn health_check(&self) -> Result<(), SendError> {
        let url = format!("{}/domains/{}", self.base_url, self.config.domain);
        let response = self
            .client
            .get(&url)
            .basic_auth("api", Some(&self.api_key))
            .send()
            .await
            .map_err(|e| Self::map_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Self::map_failure(status, &body))
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
