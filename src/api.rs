use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::collect::epoch::{ActiveEpochView, EpochTracker};
use crate::scheduler::{LastResult, LastResultStore};

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<EpochTracker>,
    pub last: LastResultStore,
}

/// Health and status routes. `/metrics` is merged in by the caller when a
/// recorder is installed.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOut {
    active_epoch: Option<ActiveEpochView>,
    last_result: Option<LastResult>,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    Json(StatusOut {
        active_epoch: state.tracker.view(),
        last_result: state.last.get(),
    })
}
