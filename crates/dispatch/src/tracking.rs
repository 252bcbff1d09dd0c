use async_trait::async_trait;

use courier_core::{Message, normalize_email};

use crate::processor::{MessageTransformer, TransformError};

/// Injects self-hosted tracking URLs into HTML bodies: an open pixel and
/// an unsubscribe footer pointing at this relay's webhook endpoints.
///
/// Injection is per-recipient by nature, so it only applies to messages
/// with a single recipient (the common transactional shape); multi-
/// recipient messages pass through untouched and rely on provider-side
/// tracking.
pub struct TrackingInjector {
    base_url: String,
}

impl TrackingInjector {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn pixel_url(&self, message: &Message, email: &str) -> String {
        format!(
            "{}/webhook/pixel?mid={}&email={}",
            self.base_url, message.id, email
        )
    }

    fn unsubscribe_url(&self, message: &Message, email: &str) -> String {
        format!(
            "{}/webhook/unsubscribe?mid={}&email={}",
            self.base_url, message.id, email
        )
    }
}

#[async_trait]
impl MessageTransformer for TrackingInjector {
    async fn transform(&self, message: &Message) -> Result<Message, TransformError> {
        let mut recipients = message.all_recipients();
        let (Some(first), None) = (recipients.next(), recipients.next()) else {
            return Ok(message.clone());
        };
        let Some(html) = &message.html else {
            return Ok(message.clone());
        };

        let email = normalize_email(first);
        let pixel = format!(
            r#"<img src="{}" width="1" height="1" alt="" style="display:none">"#,
            self.pixel_url(message, &email)
        );
        let footer = format!(
            r#"<p style="font-size:11px;color:#888"><a href="{}">Unsubscribe</a></p>"#,
            self.unsubscribe_url(message, &email)
        );

        let mut out = message.clone();
        let injected = match html.rfind("</body>") {
            Some(idx) => {
                let mut s = html.clone();
                s.insert_str(idx, &format!("{pixel}{footer}"));
                s
            }
            None => format!("{html}{pixel}{footer}"),
        };
        out.html = Some(injected);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html_message(to: Vec<String>) -> Message {
        Message::new("a@mail.example.com", to)
            .with_subject("s")
            .with_html("<html><body><p>hi</p></body></html>")
    }

    #[tokio::test]
    async fn injects_pixel_and_unsubscribe_before_body_close() {
        let injector = TrackingInjector::new("https://relay.example.com/");
        let msg = html_message(vec!["R@x.com".into()]);
        let out = injector.transform(&msg).await.unwrap();
        let html = out.html.unwrap();

        let expected_pixel = format!(
            "https://relay.example.com/webhook/pixel?mid={}&email=r@x.com",
            msg.id
        );
        assert!(html.contains(&expected_pixel));
        assert!(html.contains("/webhook/unsubscribe?mid="));
        assert!(html.ends_with("</body></html>"));
    }

    #[tokio::test]
    async fn multi_recipient_messages_pass_through() {
        let injector = TrackingInjector::new("https://relay.example.com");
        let msg = html_message(vec!["a@x.com".into(), "b@x.com".into()]);
        let out = injector.transform(&msg).await.unwrap();
        assert_eq!(out.html, msg.html);
    }

    #[tokio::test]
    async fn text_only_messages_pass_through() {
        let injector = TrackingInjector::new("https://relay.example.com");
        let msg = Message::new("a@mail.example.com", vec!["r@x.com".into()]).with_text("plain");
        let out = injector.transform(&msg).await.unwrap();
        assert!(out.html.is_none());
    }

    #[tokio::test]
    async fn html_without_body_tag_gets_appended() {
        let injector = TrackingInjector::new("https://relay.example.com");
        let msg = Message::new("a@mail.example.com", vec!["r@x.com".into()])
            .with_html("<p>fragment</p>");
        let out = injector.transform(&msg).await.unwrap();
        let html = out.html.unwrap();
        assert!(html.starts_with("<p>fragment</p><img"));
    }
}
