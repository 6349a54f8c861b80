//! Replication endpoints: the change feed and revision intake.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use kenpos_engine::{ChangesQuery, ChangesResponse, PushRequest, PushResponse, MAX_BATCH_SIZE};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

/// Create replication routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/changes", get(changes_handler))
        .route("/revisions", post(revisions_handler))
}

/// GET /changes - Read the replica's change feed.
async fn changes_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>> {
    let response = state.store.changes_since(query.since, query.limit).await?;
    tracing::debug!(
        since = query.since,
        returned = response.results.len(),
        last_seq = response.last_seq,
        "Served changes"
    );
    Ok(Json(response))
}

/// POST /revisions - Merge revisions pushed by a terminal.
async fn revisions_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    if request.revisions.len() > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(format!(
            "batch of {} revisions exceeds the limit of {}",
            request.revisions.len(),
            MAX_BATCH_SIZE
        )));
    }

    let count = request.revisions.len();
    let response = state.store.apply_revisions(request.revisions).await?;
    tracing::info!(
        node_id = %request.node_id,
        received = count,
        written = response.written,
        known = response.known,
        conflicts_resolved = response.conflicts_resolved,
        "Applied pushed revisions"
    );
    Ok(Json(response))
}
