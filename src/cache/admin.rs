//! Administrative HTTP surface.
//!
//! `POST /cache/invalidate`, `POST /cache/warm`, `GET /cache/events` and
//! `GET /health`. Mount on an internal listener only; there is no
//! authentication here.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::CacheError;

use super::events::InvalidationEvent;
use super::service::{CacheService, PurgeReport, PurgeScope};
use super::warmer::{CacheWarmer, WarmReport};

const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<CacheService>,
    pub warmer: Option<Arc<CacheWarmer>>,
}

/// Body of `POST /cache/invalidate`. At least one prefix is required; an
/// empty string clears that tier.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub fragment_prefix: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl From<InvalidateRequest> for PurgeScope {
    fn from(request: InvalidateRequest) -> Self {
        Self {
            fragment_prefix: request.fragment_prefix,
            path_prefix: request.path_prefix,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WarmRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AdminErrorBody {
    pub error: AdminErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct AdminErrorMessage {
    pub code: &'static str,
    pub message: String,
}

/// JSON error response for the admin surface.
#[derive(Debug)]
pub struct AdminError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AdminError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn empty_scope() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            "set fragment_prefix, path_prefix or both",
        )
    }

    fn warmer_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "warmer_unavailable",
            "no warm target configured",
        )
    }
}

impl From<CacheError> for AdminError {
    fn from(err: CacheError) -> Self {
        let (status, code) = match &err {
            CacheError::StoreUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            CacheError::InvalidPath { .. } | CacheError::InvalidResource { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            CacheError::ArtifactWrite { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "artifact_io"),
            CacheError::PropagationIncomplete { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "propagation_incomplete")
            }
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        warn!(
            status = self.status.as_u16(),
            error_code = self.code,
            error = %self.message,
            "Admin request failed"
        );
        let body = AdminErrorBody {
            error: AdminErrorMessage {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cache/invalidate", post(invalidate))
        .route("/cache/warm", post(warm))
        .route("/cache/events", get(recent_events))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn invalidate(
    State(state): State<AdminState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<PurgeReport>, AdminError> {
    let scope = PurgeScope::from(request);
    if scope.is_empty() {
        return Err(AdminError::empty_scope());
    }
    let report = state.cache.purge(&scope).await?;
    Ok(Json(report))
}

async fn warm(
    State(state): State<AdminState>,
    Json(request): Json<WarmRequest>,
) -> Result<Json<WarmReport>, AdminError> {
    let warmer = state.warmer.ok_or_else(AdminError::warmer_unavailable)?;
    Ok(Json(warmer.warm(&request.paths).await))
}

async fn recent_events(
    State(state): State<AdminState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<InvalidationEvent>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.cache.journal().recent(limit))
}
