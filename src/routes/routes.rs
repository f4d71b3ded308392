//! Defines routes for the chunked upload API.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz` — liveness
//!   - `GET    /readyz` — SQLite + disk readiness
//!
//! - **Upload lifecycle**
//!   - `POST   /uploads/init` — open a session
//!   - `PUT    /uploads/{upload_id}/chunk` — store one numbered chunk (multipart)
//!   - `POST   /uploads/{upload_id}/complete` — assemble, verify and store
//!   - `GET    /uploads/{upload_id}/status` — progress snapshot
//!   - `DELETE /uploads/{upload_id}` — cancel (always succeeds)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, complete_upload, init_upload, upload_chunk, upload_status,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Build the router for all upload routes.
///
/// `max_chunk_bytes` caps the request body of a single chunk upload.
pub fn routes(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload lifecycle
        .route("/uploads/init", post(init_upload))
        .route(
            "/uploads/{upload_id}/chunk",
            put(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/uploads/{upload_id}/complete", post(complete_upload))
        .route("/uploads/{upload_id}/status", get(upload_status))
        .route("/uploads/{upload_id}", delete(cancel_upload))
}
