use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::warn;

use courier_core::{DispatchStats, HealthReport, MessageStatus, ProviderStats, RateLimitSnapshot};
use courier_dispatch::{BreakerSnapshot, MetricsSnapshot};
use courier_gateway::DynGateway;

use crate::state::AppState;

/// `GET /health` -- aggregate service and provider health.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report: HealthReport = state.manager.health_report();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub dispatch: DispatchStats,
    pub metrics: MetricsSnapshot,
    pub rate_limits: Vec<RateLimitSnapshot>,
    pub circuit_breakers: Vec<BreakerSnapshot>,
}

/// `GET /stats` -- queue totals, dispatch counters, rate-limit and
/// breaker snapshots.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let counts = match state.queue.status_counts().await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "stats query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    let messages_today = state.queue.counts_today().await.unwrap_or_default();
    let hourly_stats = state
        .queue
        .hourly_sent_counts(24)
        .await
        .unwrap_or_default();

    let count = |status: MessageStatus| counts.get(&status).copied().unwrap_or_default();
    let sent = count(MessageStatus::Sent);
    let failed = count(MessageStatus::Failed) + count(MessageStatus::AuthError);
    #[allow(clippy::cast_precision_loss)]
    let success_rate = if sent + failed == 0 {
        1.0
    } else {
        sent as f64 / (sent + failed) as f64
    };

    let report = state.manager.health_report();
    let provider_stats = state
        .manager
        .all_gateways()
        .into_iter()
        .map(|gw| {
            let healthy = report
                .providers
                .iter()
                .find(|p| p.gateway_id == gw.id())
                .is_none_or(|p| p.healthy);
            ProviderStats {
                gateway_id: gw.id().to_owned(),
                kind: gw.kind().to_string(),
                sent: state.manager.limiter().gateway_daily_count(gw.id()),
                failed: 0,
                healthy,
            }
        })
        .collect();

    let dispatch = DispatchStats {
        total_messages: counts.values().sum(),
        messages_queued: count(MessageStatus::Queued),
        messages_processing: count(MessageStatus::Processing),
        messages_sent: sent,
        messages_failed: failed,
        messages_today,
        success_rate,
        hourly_stats,
        provider_stats,
    };

    Json(StatsResponse {
        dispatch,
        metrics: state.metrics.snapshot(),
        rate_limits: state.manager.limiter().snapshots(),
        circuit_breakers: state.manager.breaker_snapshots(),
    })
    .into_response()
}

/// `POST /reload` -- ask the boot task to re-read gateway and pool
/// configuration from the store.
pub async fn reload(State(state): State<AppState>) -> impl IntoResponse {
    state.reload.send_modify(|n| *n += 1);
    (StatusCode::ACCEPTED, Json(serde_json::json!({"status": "reload scheduled"})))
}
