use serde::Deserialize;

/// Successful response from `POST /{domain}/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct MailgunSendResponse {
    /// Provider message id, e.g. `<20260210.12345@mail.example.com>`.
    pub id: Option<String>,
    /// Human-readable acknowledgement, e.g. `"Queued. Thank you."`.
    #[serde(default)]
    pub message: Option<String>,
}

/// Error body Mailgun returns on 4xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct MailgunErrorResponse {
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_response() {
        let body = r#"{"id":"<2026@mail.example.com>","message":"Queued. Thank you."}"#;
        let resp: MailgunSendResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.id.as_deref(), Some("<2026@mail.example.com>"));
        assert_eq!(resp.message.as_deref(), Some("Queued. Thank you."));
    }

    #[test]
    fn parses_error_response() {
        let body = r#"{"message":"'to' parameter is not a valid address"}"#;
        let resp: MailgunErrorResponse = serde_json::from_str(body).unwrap();
        assert!(resp.message.unwrap().contains("not a valid address"));
    }
}
