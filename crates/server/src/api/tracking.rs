use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse};
use tracing::{debug, warn};
use uuid::Uuid;

use courier_core::EngagementKind;

use crate::state::AppState;

use super::{client_ip, user_agent};

/// A 1×1 transparent PNG, returned by the tracking pixel no matter what.
const PIXEL_PNG: [u8; 67] = [
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

fn parse_target(params: &HashMap<String, String>) -> Option<(Uuid, String)> {
    let mid = params.get("mid").and_then(|v| Uuid::parse_str(v).ok())?;
    let email = params.get("email")?.clone();
    Some((mid, email))
}

async fn record(
    state: &AppState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    kind: EngagementKind,
    data: serde_json::Value,
) {
    let Some((message_id, email)) = parse_target(params) else {
        debug!(?kind, "tracking request without mid/email");
        return;
    };
    if let Err(e) = state
        .tracker
        .record_engagement(
            message_id,
            &email,
            kind,
            data,
            client_ip(headers).as_deref(),
            user_agent(headers).as_deref(),
        )
        .await
    {
        warn!(message_id = %message_id, email, error = %e, "tracking recording failed");
    }
}

/// `GET /webhook/pixel?mid=&email=` -- open tracking. Always returns the
/// pixel, regardless of recording success.
pub async fn pixel(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    record(
        &state,
        &params,
        &headers,
        EngagementKind::Open,
        serde_json::json!({"source": "pixel"}),
    )
    .await;

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        PIXEL_PNG.to_vec(),
    )
}

/// `GET /webhook/click?mid=&email=&url=` -- click tracking. Always
/// answers with a 302 to the target URL.
pub async fn click(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let url = params.get("url").cloned().unwrap_or_else(|| "/".to_owned());
    record(
        &state,
        &params,
        &headers,
        EngagementKind::Click,
        serde_json::json!({"source": "click", "url": url}),
    )
    .await;

    (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
}

/// `GET|POST /webhook/unsubscribe?mid=&email=` -- unsubscribe landing.
pub async fn unsubscribe(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    record(
        &state,
        &params,
        &headers,
        EngagementKind::Unsubscribe,
        serde_json::json!({"source": "unsubscribe"}),
    )
    .await;

    Html(
        "<html><body><h2>You have been unsubscribed.</h2>\
         <p>You will no longer receive messages from this sender.</p></body></html>",
    )
}
