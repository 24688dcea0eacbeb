//! Read and management endpoints over the error-group store.

use axum::extract::{Path, Query, State};
use axum::Json;
use errly_core::{ErrorGroup, GroupStatus, Severity};
use errly_store::{GroupFilter, GroupStats, TimeRange};
use serde::{Deserialize, Serialize};

use crate::api::auth::RequireSession;
use crate::error::ApiError;
use crate::hub::PushEvent;
use crate::AppState;

/// Most ids accepted by a single bulk delete.
pub const BULK_DELETE_MAX_IDS: usize = 500;

/// Default page size for listings.
const DEFAULT_PAGE_SIZE: i64 = 50;

/// Largest page size for listings.
const MAX_PAGE_SIZE: i64 = 200;

/// Query parameters for the listing endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Filter by service name.
    pub service: Option<String>,
    /// Filter by severity (`warn`, `error`, `fatal`).
    pub severity: Option<String>,
    /// Filter by status (`new`, `investigating`, `in-progress`, `resolved`).
    pub status: Option<String>,
    /// Time range (`1h`, `24h`, `7d`, `30d`).
    pub range: Option<String>,
    /// Substring search over message and stack trace.
    pub q: Option<String>,
    /// Page size (default 50, max 200).
    pub limit: Option<i64>,
    /// Pagination offset.
    pub offset: Option<i64>,
}

/// Response for the listing endpoint.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Matching groups, most recently seen first.
    pub errors: Vec<ErrorGroup>,
    /// Total matches ignoring pagination.
    pub total: i64,
}

/// Handle `GET /api/errors`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn list(
    State(state): State<AppState>,
    _session: RequireSession,
    Query(params): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let filter = build_filter(&params)?;
    let page = state
        .store
        .list_groups(&filter, chrono::Utc::now().timestamp_millis())
        .await?;
    Ok(Json(ListResponse {
        errors: page.groups,
        total: page.total,
    }))
}

/// Handle `GET /api/errors/{id}`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn detail(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(id): Path<String>,
) -> Result<Json<ErrorGroup>, ApiError> {
    let group = state
        .store
        .get_group(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("error group {id}")))?;
    Ok(Json(group))
}

/// Query parameters for the related endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct RelatedQuery {
    /// Window half-width in minutes (1-60, default 5).
    pub window: Option<i64>,
}

/// Response for the related endpoint.
#[derive(Debug, Serialize)]
pub struct RelatedResponse {
    /// Groups from other services in the window.
    pub related: Vec<ErrorGroup>,
}

/// Handle `GET /api/errors/{id}/related`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn related(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(id): Path<String>,
    Query(params): Query<RelatedQuery>,
) -> Result<Json<RelatedResponse>, ApiError> {
    let related = state.store.related_groups(&id, params.window).await?;
    Ok(Json(RelatedResponse { related }))
}

/// Body for the status-update endpoint.
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    /// New status.
    pub status: String,
}

/// Handle `PATCH /api/errors/{id}/status`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn update_status(
    State(state): State<AppState>,
    _session: RequireSession,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateRequest>,
) -> Result<Json<ErrorGroup>, ApiError> {
    let status: GroupStatus = body
        .status
        .parse()
        .map_err(|_| ApiError::validation(format!("unknown status: {}", body.status)))?;

    let group = state
        .store
        .update_group_status(&id, status, chrono::Utc::now().timestamp_millis())
        .await?;

    state.hub.broadcast(&PushEvent::ErrorUpdated {
        error: group.summary(),
    });
    Ok(Json(group))
}

/// Body for bulk deletion by id.
#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    /// Ids to delete (at most 500).
    pub ids: Vec<String>,
}

/// Response for both delete endpoints.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    /// How many groups actually existed and were deleted.
    pub deleted: u64,
}

/// Handle `POST /api/errors/delete`.
#[tracing::instrument(skip(state, _session, body))]
pub(crate) async fn delete_many(
    State(state): State<AppState>,
    _session: RequireSession,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    if body.ids.is_empty() {
        return Err(ApiError::validation("ids must not be empty"));
    }
    if body.ids.len() > BULK_DELETE_MAX_IDS {
        return Err(ApiError::validation(format!(
            "at most {BULK_DELETE_MAX_IDS} ids per delete"
        )));
    }

    let deleted = state.store.delete_groups(&body.ids).await?;
    if deleted > 0 {
        state
            .hub
            .broadcast(&PushEvent::ErrorCleared { ids: body.ids });
    }
    Ok(Json(DeleteResponse { deleted }))
}

/// Body for delete-all.
#[derive(Debug, Deserialize)]
pub struct DeleteAllRequest {
    /// Must be `true`; everything else is refused.
    #[serde(default)]
    pub confirm: bool,
}

/// Handle `POST /api/errors/delete-all`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn delete_all(
    State(state): State<AppState>,
    _session: RequireSession,
    Json(body): Json<DeleteAllRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    if !body.confirm {
        return Err(ApiError::validation("set confirm: true to delete all errors"));
    }

    let deleted = state.store.delete_all_groups().await?;
    if deleted > 0 {
        state.hub.broadcast(&PushEvent::BulkCleared);
    }
    Ok(Json(DeleteResponse { deleted }))
}

/// Handle `GET /api/errors/stats`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn stats(
    State(state): State<AppState>,
    _session: RequireSession,
) -> Result<Json<GroupStats>, ApiError> {
    let stats = state
        .store
        .group_stats(chrono::Utc::now().timestamp_millis())
        .await?;
    Ok(Json(stats))
}

/// Handle `GET /api/services`.
#[tracing::instrument(skip(state, _session))]
pub(crate) async fn services(
    State(state): State<AppState>,
    _session: RequireSession,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.store.distinct_services().await?))
}

fn build_filter(params: &ListQuery) -> Result<GroupFilter, ApiError> {
    let severity = params
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let status = params
        .status
        .as_deref()
        .map(str::parse::<GroupStatus>)
        .transpose()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let time_range = params
        .range
        .as_deref()
        .map(str::parse::<TimeRange>)
        .transpose()
        .map_err(ApiError::Validation)?;

    Ok(GroupFilter {
        service: params.service.clone(),
        severity,
        status,
        time_range,
        search: params.q.clone().filter(|q| !q.is_empty()),
        limit: params
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: params.offset.unwrap_or(0).max(0),
    })
}
