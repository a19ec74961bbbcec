use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::alert_core::OperatorDecision;
use crate::audit::{AuditRecord, OperatorActionRecord};
use crate::broker::{OrderSide, PlaceOrderRequest};
use crate::types::{AppState, Candle, Tick};

/// Response for tick ingestion
#[derive(Serialize)]
pub struct TickResponse {
    pub accepted: bool,
}

/// Response for candle ingestion
#[derive(Serialize)]
pub struct CandleResponse {
    pub accepted: usize,
}

/// Query params for the alerts endpoint
#[derive(Debug, Deserialize)]
pub struct AlertsQueryParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub symbol: Option<String>,
}

/// Operator decision on a delivered alert
#[derive(Debug, Deserialize)]
pub struct OperatorActionRequest {
    pub operator_id: String,
    pub decision: OperatorDecision,
    /// Order side when executing; defaults to buy
    pub side: Option<OrderSide>,
    /// Contracts when executing; defaults to 1
    pub volume: Option<u32>,
}

/// POST /api/ticks - feed one tick through the detectors
pub async fn ingest_tick(
    State(state): State<Arc<AppState>>,
    Json(tick): Json<Tick>,
) -> impl IntoResponse {
    state
        .active_symbols
        .write()
        .await
        .insert(tick.symbol.clone());

    let accepted = state.engine.on_tick(&tick).await;
    (StatusCode::OK, Json(TickResponse { accepted }))
}

/// POST /api/candles - feed one closed candle through the detectors
pub async fn ingest_candle(
    State(state): State<Arc<AppState>>,
    Json(candle): Json<Candle>,
) -> impl IntoResponse {
    state
        .active_symbols
        .write()
        .await
        .insert(candle.symbol.clone());

    let accepted = state.engine.on_candle(candle).await;
    (StatusCode::OK, Json(CandleResponse { accepted }))
}

/// GET /api/metrics - queue counters snapshot
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.engine.queue().metrics().await;
    (StatusCode::OK, Json(serde_json::json!(metrics)))
}

/// GET /api/alerts - audit records, filterable by time range and symbol
pub async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertsQueryParams>,
) -> impl IntoResponse {
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - Duration::hours(24));

    match state
        .audit
        .query(from, to, params.symbol.as_deref())
        .await
    {
        Ok(records) => (
            StatusCode::OK,
            Json(serde_json::json!({ "records": records })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

/// POST /api/alerts/{id}/action - record an operator decision.
///
/// Executing places a bracket order through the gateway and links the
/// ticket; every decision lands in the audit log exactly once.
pub async fn post_alert_action(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<OperatorActionRequest>,
) -> impl IntoResponse {
    let now = Utc::now();
    let records = match state.audit.query(now - Duration::hours(24), now, None).await {
        Ok(records) => records,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    };

    let Some(alert) = records.iter().find_map(|r| match r {
        AuditRecord::Alert(a) if a.alert_id == id => Some(a.clone()),
        _ => None,
    }) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "alert not found" })),
        );
    };

    let already_acted = records
        .iter()
        .any(|r| matches!(r, AuditRecord::OperatorAction(a) if a.alert_id == id));
    if already_acted {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "alert already acted upon" })),
        );
    }

    let ticket = if request.decision == OperatorDecision::Executed {
        let order = PlaceOrderRequest {
            symbol: alert.symbol.clone(),
            side: request.side.unwrap_or(OrderSide::Buy),
            volume: request.volume.unwrap_or(1),
            entry: alert.price,
            stop_loss: alert.stop_loss,
            take_profit: alert.take_profit,
        };
        match state.gateway.place_order(&order).await {
            Ok(ticket) => Some(ticket.ticket),
            Err(e) => {
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
            }
        }
    } else {
        None
    };

    let record = AuditRecord::OperatorAction(OperatorActionRecord {
        alert_id: id,
        symbol: alert.symbol.clone(),
        operator_id: request.operator_id.clone(),
        decision: request.decision,
        ticket: ticket.clone(),
        timestamp: Utc::now(),
    });
    if let Err(e) = state.audit.record(record).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        );
    }

    info!(
        "operator {} marked alert {} as {:?}{}",
        request.operator_id,
        id,
        request.decision,
        ticket
            .as_deref()
            .map(|t| format!(" (ticket {})", t))
            .unwrap_or_default()
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "recorded", "ticket": ticket })),
    )
}
