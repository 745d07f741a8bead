//! Channel webhook endpoints. Every successfully authenticated delivery is
//! acknowledged with 200, including ones whose events were all filtered out.

use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::error::IngestError;
use crate::ingest::IngestReport;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn ack(report: IngestReport) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "accepted": report.accepted,
        "duplicates": report.duplicates,
        "ignored": report.ignored,
    }))
}

/// `GET` subscription handshake; echoes `hub.challenge` as plain text.
pub async fn cloud_api_verify(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match state
        .dispatcher
        .verify_cloud_subscription(workspace_id, &params)
        .await
    {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(IngestError::Unauthorized(reason)) => {
            debug!(workspace_id = %workspace_id, reason = %reason, "Subscription handshake refused");
            (StatusCode::FORBIDDEN, "forbidden").into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

pub async fn cloud_api_receive(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let report = state
        .dispatcher
        .handle_cloud_api(
            workspace_id,
            header(&headers, "x-hub-signature-256"),
            &body,
        )
        .await?;
    Ok(ack(report))
}

pub async fn evolution_receive(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::from(IngestError::Malformed(e.to_string())))?;
    let report = state
        .dispatcher
        .handle_evolution(workspace_id, header(&headers, "apikey"), &payload)
        .await?;
    Ok(ack(report))
}
