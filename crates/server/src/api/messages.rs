use std::collections::HashMap;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use courier_core::Message;
use courier_store::StoreError;

use crate::state::AppState;

/// Producer-facing submission payload (the SMTP listener converts each
/// DATA into one of these).
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub invitation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: Uuid,
    pub status: String,
}

/// `POST /messages` -- enqueue one outbound message.
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> impl IntoResponse {
    if request.from.is_empty() || request.to.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "from and to are required"})),
        )
            .into_response();
    }

    let mut message = Message::new(request.from, request.to)
        .with_cc(request.cc)
        .with_bcc(request.bcc)
        .with_subject(request.subject);
    message.html = request.html;
    message.text = request.text;
    message.headers = request.headers;
    message.workspace_id = request.workspace_id;
    message.campaign_id = request.campaign_id;
    message.user_id = request.user_id;
    message.invitation_id = request.invitation_id;

    let id = message.id;
    match state.queue.enqueue(message).await {
        Ok(()) => {
            info!(message_id = %id, "message enqueued");
            (
                StatusCode::ACCEPTED,
                Json(EnqueueResponse {
                    id,
                    status: "queued".into(),
                }),
            )
                .into_response()
        }
        Err(StoreError::Duplicate(detail)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": detail})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
