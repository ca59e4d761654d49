//! HTTP surface.
//!
//! - `POST /message` appends `{stream, id?, message}` to a stream
//! - `GET /messages?stream=&version=` long-polls for entries newer than
//!   `version`

mod error;
mod handlers;

pub use error::ApiError;
pub use handlers::{append_message, poll_messages, AppendRequest, PollQuery};

use crate::mux::Multiplexer;
use crate::store::LogStore;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline of one long-poll request.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LogStore>,
    pub mux: Arc<Multiplexer>,
    pub poll_timeout: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/message", post(append_message))
        .route("/messages", get(poll_messages))
        .with_state(state)
}
