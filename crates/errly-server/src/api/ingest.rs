//! Direct error ingestion.
//!
//! `POST /api/errors`, authenticated by the `X-Errly-Token` header rather
//! than a session: this is the endpoint applications and the browser SDK
//! report into. Tokens are compared constant-time over SHA-256 digests.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use errly_core::{ErrorEvent, ErrorSource, Severity};
use serde::{Deserialize, Serialize};

use crate::api::auth::secrets_match;
use crate::error::ApiError;
use crate::hub::PushEvent;
use crate::AppState;

/// Header carrying the ingestion token.
pub const TOKEN_HEADER: &str = "x-errly-token";

/// Request body cap, enforced by the router's body-limit layer.
pub const MAX_BODY_BYTES: usize = 262_144;

/// Ingestion request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    /// Reporting service name. Required.
    pub service: Option<String>,
    /// Error message. Required.
    pub message: Option<String>,
    /// Stack trace, if the reporter has one.
    pub stack_trace: Option<String>,
    /// Severity (`warn`, `error`, `fatal`); defaults to `error`.
    pub severity: Option<String>,
    /// `"METHOD /path"` the error concerns, if any.
    pub endpoint: Option<String>,
    /// Opaque key/value metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Ingestion response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Id of the (possibly pre-existing) group.
    pub id: String,
    /// The group's fingerprint.
    pub fingerprint: String,
    /// Whether this submission created the group.
    pub is_new: bool,
}

/// Handle `POST /api/errors`.
#[tracing::instrument(skip(state, headers, body))]
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    authorize(&state, &headers).await?;

    let service = body
        .service
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::validation("service is required"))?;
    let message = body
        .message
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::validation("message is required"))?;

    let severity = match body.severity.as_deref() {
        None => Severity::Error,
        Some(s) => s
            .parse()
            .map_err(|_| ApiError::validation(format!("unknown severity: {s}")))?,
    };

    let event = ErrorEvent {
        service: service.to_owned(),
        deployment_id: None,
        message: message.to_owned(),
        stack_trace: body.stack_trace.clone(),
        severity,
        endpoint: body.endpoint.clone(),
        raw_log: message.to_owned(),
        source: ErrorSource::Direct,
        metadata: body.metadata.clone(),
    };

    let outcome = state.grouper.process(event).await?;
    state.meter.record(chrono::Utc::now().timestamp_millis());

    let error = outcome.group.summary();
    if outcome.is_new {
        state.hub.broadcast(&PushEvent::NewError { error });
    } else {
        state.hub.broadcast(&PushEvent::ErrorUpdated { error });
    }

    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            id: outcome.group.id,
            fingerprint: outcome.group.fingerprint,
            is_new: outcome.is_new,
        }),
    ))
}

/// Check the `X-Errly-Token` header against the configured token.
///
/// The stored `ingestToken` setting wins; the dashboard password is the
/// fallback so a fresh install can report errors before any settings
/// exist.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let expected = match state.store.ingest_token().await? {
        Some(token) if !token.is_empty() => token,
        _ => state
            .config
            .password
            .clone()
            .ok_or(ApiError::Unauthorized)?,
    };

    if secrets_match(provided, &expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}
