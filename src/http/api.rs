//! Sequence control endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::channels::{ChannelKind, normalize_phone};
use crate::resolver::ResolveRequest;
use crate::sequence::CartDetails;

/// `POST /api/follow-ups/{id}/{convert|cancel|pause|resume}`
pub async fn follow_up_action(
    State(state): State<AppState>,
    Path((id, action)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    let scheduler = &state.scheduler;
    let run = match action.as_str() {
        "convert" => scheduler.convert(id).await?,
        "cancel" => scheduler.cancel(id).await?,
        "pause" => scheduler.pause(id).await?,
        "resume" => scheduler.resume(id).await?,
        other => {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("unknown action: {other}"),
            ));
        }
    };
    info!(follow_up_id = %id, action = %action, status = %run.status, "Sequence action applied");
    Ok(Json(run).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedCartRequest {
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    pub channel: ChannelKind,
    #[serde(default)]
    pub cart_url: Option<String>,
    #[serde(default)]
    pub total: Option<Decimal>,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// `POST /api/workspaces/{workspace_id}/abandoned-carts`
///
/// Resolves the customer's conversation and (re)starts cart recovery on it.
pub async fn start_abandoned_cart(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
    Json(body): Json<AbandonedCartRequest>,
) -> Result<Response, ApiError> {
    let db = state.gateway.db();
    let workspace = db
        .get_workspace(workspace_id)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "workspace not found"))?;
    let phone = normalize_phone(&body.phone)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "phone has no digits"))?;

    let resolved = state
        .resolver
        .resolve(
            &ResolveRequest {
                workspace_id,
                phone_number: &phone,
                display_name: body.name.as_deref(),
                channel: body.channel,
                external_id: None,
                metadata: None,
                ai_enabled: workspace.ai_enabled_default,
            },
            state.gateway.now(),
        )
        .await?;
    if resolved.conversation_created {
        state
            .gateway
            .conversation_updated(&resolved.conversation, true);
    }

    let cart = CartDetails {
        cart_url: body.cart_url,
        total: body.total,
        items: body.items,
    };
    let started = state
        .scheduler
        .start_abandoned_cart(
            workspace_id,
            resolved.client.id,
            resolved.conversation.id,
            cart,
        )
        .await?;

    Ok(match started {
        Some(run) => (StatusCode::CREATED, Json(json!(run))).into_response(),
        None => Json(json!({ "status": "no_rules" })).into_response(),
    })
}
