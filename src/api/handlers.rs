//! REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::debug;

use super::types::{
    CreateSessionRequest, ErrorResponse, EventsQuery, EventsResponse, InputRequest,
    ListSessionsQuery, ListSessionsResponse, ResizeRequest, WireEvent,
};
use crate::error::RelayError;
use crate::orchestrator::SessionOrchestrator;
use crate::session::{SessionFilter, SessionId, SessionRecord};
use crate::store::blocking;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(e: RelayError) -> ApiError {
    let body = ErrorResponse::from(&e);
    (body.status(), Json(body))
}

fn bad_request(body: ErrorResponse) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(body))
}

pub(crate) fn parse_id(id: &str) -> Result<SessionId, ApiError> {
    id.parse().map_err(api_error)
}

fn require(state: &AppState, id: &SessionId) -> Result<SessionRecord, ApiError> {
    state
        .orchestrator
        .get(id)
        .map_err(api_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::session_not_found(id.as_str())),
            )
        })
}

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

/// API information endpoint.
pub async fn api_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "shell-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "kinds": state.orchestrator.registry().kinds(),
    }))
}

/// List sessions, optionally filtered by status, owner or kind.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<ListSessionsResponse>, ApiError> {
    let mut filter = SessionFilter::default();
    if let Some(status) = query.status {
        filter = filter.status(status);
    }
    if let Some(owner) = query.owner {
        filter = filter.owner(owner);
    }
    if let Some(kind) = query.kind {
        filter = filter.kind(kind);
    }

    let sessions = state.orchestrator.list(Some(&filter)).map_err(api_error)?;
    Ok(Json(ListSessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// Create and start a new session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionRecord>), ApiError> {
    let record = state
        .orchestrator
        .create_session(&req.kind, req.options.into_create_options())
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Get a session.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(require(&state, &id)?))
}

/// Close a session if needed and remove it with its event log.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if state.orchestrator.delete_session(&id).await.map_err(api_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::session_not_found(id.as_str())),
        ))
    }
}

/// Replay recorded events.
pub async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let id = parse_id(&id)?;
    require(&state, &id)?;

    let store = state.orchestrator.events().clone();
    let session_id = id.clone();
    let events = blocking(move || store.get_events(&session_id, query.after))
        .await
        .map_err(api_error)?;
    let last_seq = events.last().map_or(query.after, |e| e.seq);
    debug!(session_id = %id, after = query.after, count = events.len(), "Replayed events");

    Ok(Json(EventsResponse {
        session_id: id.to_string(),
        events: events.iter().map(WireEvent::from).collect(),
        last_seq,
    }))
}

/// Send input to a running session.
pub async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let data = req.bytes().map_err(bad_request)?;
    state
        .orchestrator
        .send_input(&id, &data)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// Resize a running session's terminal.
pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    if req.cols == 0 || req.rows == 0 {
        return Err(bad_request(ErrorResponse::bad_request(
            "cols and rows must be positive",
        )));
    }
    state
        .orchestrator
        .resize(&id, req.cols, req.rows)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request a graceful stop. Returns the session as it is right now.
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .orchestrator
        .close_session(&id)
        .await
        .map_err(api_error)?;
    Ok(Json(record))
}
