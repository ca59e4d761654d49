//! Request handlers for the append and long-poll endpoints.

use super::error::ApiError;
use super::AppState;
use crate::types::{Cursor, Fields, IdRequest, StreamName};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Body of `POST /message`.
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub stream: StreamName,
    /// Explicit id (`"<ms>-<seq>"`, `"<ms>"`, `"<ms>-*"` or `"*"`); absent
    /// means auto.
    #[serde(default)]
    pub id: Option<String>,
    pub message: Fields,
}

/// Query of `GET /messages`.
#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub stream: StreamName,
    /// The caller's cursor.
    pub version: String,
}

/// Append a message. 204 on success, 409 if the id does not advance the
/// stream.
pub async fn append_message(
    State(state): State<AppState>,
    Json(request): Json<AppendRequest>,
) -> Result<StatusCode, ApiError> {
    let AppendRequest {
        stream,
        id,
        message,
    } = request;
    let id = match id.as_deref() {
        Some(raw) => raw.parse::<IdRequest>()?,
        None => IdRequest::Auto,
    };

    let store = Arc::clone(&state.store);
    let appended = tokio::task::spawn_blocking(move || {
        let result = store.append(&stream, id, message);
        (stream, result)
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;

    let (stream, result) = appended;
    let id = result?;
    debug!(%stream, %id, "appended message");
    Ok(StatusCode::NO_CONTENT)
}

/// Long-poll for messages newer than `version`.
///
/// Resolves with every newer message as soon as one lands, or with an
/// empty array once the poll timeout elapses.
pub async fn poll_messages(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<Fields>>, ApiError> {
    let cursor: Cursor = query.version.parse()?;
    let entries = state
        .mux
        .wait(query.stream, cursor, state.poll_timeout)
        .await;

    Ok(Json(entries.into_iter().map(|entry| entry.fields).collect()))
}
