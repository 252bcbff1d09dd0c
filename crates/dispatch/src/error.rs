use thiserror::Error;

use courier_core::LimitScope;
use courier_gateway::SendError;
use courier_store::StoreError;

/// Errors raised inside the dispatch pipeline. The processor catches and
/// classifies these at the per-message boundary; only tick-level store
/// failures propagate further.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The message cannot be sent as-is (unresolved variables, no
    /// deliverable recipients). Non-retriable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No gateway can handle the sender.
    #[error("no_gateway_available: {0}")]
    Routing(String),

    /// A hierarchical rate cap denied admission.
    #[error("rate limited ({scope}), retry after {retry_after_seconds}s")]
    RateLimited {
        scope: LimitScope,
        retry_after_seconds: u64,
    },

    /// The gateway's circuit breaker is open.
    #[error("circuit_open: {gateway}")]
    CircuitOpen { gateway: String },

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Downstream send failure, already classified by the gateway layer.
    #[error(transparent)]
    Send(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_error_names_its_kind() {
        let err = DispatchError::Routing("sender acme.com".into());
        assert!(err.to_string().starts_with("no_gateway_available"));
    }

    #[test]
    fn rate_limited_display() {
        let err = DispatchError::RateLimited {
            scope: LimitScope::UserDaily,
            retry_after_seconds: 120,
        };
        assert_eq!(err.to_string(), "rate limited (user_daily), retry after 120s");
    }
}
