use std::time::Duration;

use thiserror::Error;

use courier_core::{DeliveryStatus, MessageStatus};

/// Errors surfaced by a delivery gateway's send path.
#[derive(Debug, Error)]
pub enum SendError {
    /// The provider rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The provider reported the recipient undeliverable synchronously.
    #[error("bounced: {0}")]
    Bounce(String),

    /// The provider throttled us.
    #[error("provider rate limited{}", .retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited {
        /// Provider-suggested wait, if it sent one.
        retry_after: Option<Duration>,
    },

    /// Network failure or provider 5xx. Worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Provider 4xx not otherwise classified. Not worth retrying.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The message cannot be expressed on this provider's wire format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The send did not complete within the allowed duration.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The gateway was built from unusable configuration.
    #[error("invalid gateway configuration: {0}")]
    Configuration(String),
}

/// How a send failure maps onto message and recipient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Credentials rejected: message `auth_error`, recipients `deferred`.
    Auth,
    /// Synchronous bounce: message `failed`, recipients `bounced`.
    Bounce,
    /// Everything else: message `failed`, recipients `failed`.
    Other,
}

impl FailureClass {
    /// Message status this class resolves to.
    #[must_use]
    pub fn message_status(self) -> MessageStatus {
        match self {
            Self::Auth => MessageStatus::AuthError,
            Self::Bounce | Self::Other => MessageStatus::Failed,
        }
    }

    /// Per-recipient delivery status this class resolves to.
    #[must_use]
    pub fn delivery_status(self) -> DeliveryStatus {
        match self {
            Self::Auth => DeliveryStatus::Deferred,
            Self::Bounce => DeliveryStatus::Bounced,
            Self::Other => DeliveryStatus::Failed,
        }
    }
}

/// Classify free-form failure text by case-insensitive substring.
#[must_use]
pub fn classify_failure_text(text: &str) -> FailureClass {
    let lower = text.to_ascii_lowercase();
    const AUTH_MARKERS: [&str; 3] = ["authentication", "unauthorized", "invalid credentials"];
    const BOUNCE_MARKERS: [&str; 3] = ["bounce", "invalid email", "does not exist"];
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Auth
    } else if BOUNCE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Bounce
    } else {
        FailureClass::Other
    }
}

impl SendError {
    /// Whether the operation may succeed if retried against the same
    /// gateway.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    /// Map this error onto the message/recipient state machine. Typed
    /// variants classify structurally; generic variants fall back to the
    /// failure-text substring rules.
    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Auth(_) => FailureClass::Auth,
            Self::Bounce(_) => FailureClass::Bounce,
            Self::Transient(text) | Self::Permanent(text) | Self::InvalidMessage(text) => {
                classify_failure_text(text)
            }
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Configuration(_) => {
                FailureClass::Other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SendError::Transient("connection reset".into()).is_retryable());
        assert!(SendError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(SendError::RateLimited { retry_after: None }.is_retryable());
    }

    #[test]
    fn non_retryable_errors() {
        assert!(!SendError::Auth("401".into()).is_retryable());
        assert!(!SendError::Bounce("user unknown".into()).is_retryable());
        assert!(!SendError::Permanent("400".into()).is_retryable());
        assert!(!SendError::InvalidMessage("no body".into()).is_retryable());
        assert!(!SendError::Configuration("bad key".into()).is_retryable());
    }

    #[test]
    fn substring_classification() {
        assert_eq!(
            classify_failure_text("SMTP Authentication required"),
            FailureClass::Auth
        );
        assert_eq!(classify_failure_text("401 UNAUTHORIZED"), FailureClass::Auth);
        assert_eq!(
            classify_failure_text("Invalid Credentials supplied"),
            FailureClass::Auth
        );
        assert_eq!(classify_failure_text("hard bounce"), FailureClass::Bounce);
        assert_eq!(
            classify_failure_text("recipient does not exist"),
            FailureClass::Bounce
        );
        assert_eq!(
            classify_failure_text("Invalid Email address"),
            FailureClass::Bounce
        );
        assert_eq!(classify_failure_text("503 backend sad"), FailureClass::Other);
    }

    #[test]
    fn typed_variants_classify_structurally() {
        assert_eq!(SendError::Auth("x".into()).failure_class(), FailureClass::Auth);
        assert_eq!(
            SendError::Bounce("x".into()).failure_class(),
            FailureClass::Bounce
        );
        // A transient error whose text mentions a bounce marker still
        // follows the substring rules.
        assert_eq!(
            SendError::Transient("upstream said: invalid email".into()).failure_class(),
            FailureClass::Bounce
        );
        assert_eq!(
            SendError::Timeout(Duration::from_secs(1)).failure_class(),
            FailureClass::Other
        );
    }

    #[test]
    fn class_state_mapping() {
        assert_eq!(FailureClass::Auth.message_status(), MessageStatus::AuthError);
        assert_eq!(FailureClass::Auth.delivery_status(), DeliveryStatus::Deferred);
        assert_eq!(FailureClass::Bounce.message_status(), MessageStatus::Failed);
        assert_eq!(FailureClass::Bounce.delivery_status(), DeliveryStatus::Bounced);
        assert_eq!(FailureClass::Other.message_status(), MessageStatus::Failed);
        assert_eq!(FailureClass::Other.delivery_status(), DeliveryStatus::Failed);
    }

    #[test]
    fn error_display() {
        let err = SendError::Auth("bad key".into());
        assert_eq!(err.to_string(), "authentication failed: bad key");

        let err = SendError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(err.to_string(), "provider rate limited, retry after 60s");

        let err = SendError::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "provider rate limited");
    }
}
