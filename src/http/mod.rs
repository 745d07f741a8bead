//! HTTP surface: channel webhooks, sequence control API, live event feed.

pub mod api;
pub mod events;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::error::{ChannelError, IngestError, SequenceError};
use crate::ingest::IngestDispatcher;
use crate::notify::Gateway;
use crate::resolver::Resolver;
use crate::sequence::SequenceScheduler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub dispatcher: Arc<IngestDispatcher>,
    pub scheduler: Arc<SequenceScheduler>,
    pub resolver: Arc<Resolver>,
    /// Bearer token required on `/api/*` when set.
    pub api_token: Option<Arc<SecretString>>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/follow-ups/{id}/{action}", post(api::follow_up_action))
        .route(
            "/api/workspaces/{workspace_id}/abandoned-carts",
            post(api::start_abandoned_cart),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/whatsapp-cloud/{workspace_id}",
            get(webhooks::cloud_api_verify).post(webhooks::cloud_api_receive),
        )
        .route(
            "/webhooks/evolution/{workspace_id}",
            post(webhooks::evolution_receive),
        )
        .route("/ws/events", get(events::ws_handler))
        .merge(api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "followup-engine"
    }))
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(token) = &state.api_token {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(token.expose_secret()) {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }
    next.run(request).await
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Error type for handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status, self.message)
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let status = match &e {
            IngestError::WorkspaceNotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngestError::Channel(ChannelError::MissingCredentials { .. }) => StatusCode::NOT_FOUND,
            IngestError::Channel(_) => StatusCode::BAD_REQUEST,
            // Upstream redelivers on 5xx.
            IngestError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            warn!(error = %e, "Webhook failed, asking channel to retry");
        }
        Self::new(status, e.to_string())
    }
}

impl From<SequenceError> for ApiError {
    fn from(e: SequenceError) -> Self {
        let status = match &e {
            SequenceError::NotFound(_) => StatusCode::NOT_FOUND,
            SequenceError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SequenceError::Database(_) | SequenceError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<crate::error::DatabaseError> for ApiError {
    fn from(e: crate::error::DatabaseError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}
