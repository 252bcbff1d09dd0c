pub mod health;
pub mod messages;
pub mod tracking;
pub mod webhooks;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full HTTP surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/stats", get(health::stats))
        .route("/reload", post(health::reload))
        .route("/messages", post(messages::enqueue))
        .route("/webhook/mandrill", post(webhooks::mandrill))
        .route("/webhook/mailgun", post(webhooks::mailgun))
        .route("/webhook/pixel", get(tracking::pixel))
        .route("/webhook/click", get(tracking::click))
        .route(
            "/webhook/unsubscribe",
            get(tracking::unsubscribe).post(tracking::unsubscribe),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Client IP as seen through reverse proxies: first `X-Forwarded-For`
/// hop, then `X-Real-IP`.
#[must_use]
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return Some(first.to_owned());
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// User agent header, when present.
#[must_use]
pub fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
}
