//! Chunked upload and assembly service.
//!
//! Clients open an upload session, send numbered chunks in any order, then
//! ask the service to assemble, checksum and store the finished file.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::Router;
use state::AppState;

/// Router with every route mounted and `state` attached.
pub fn app(state: AppState, max_chunk_bytes: usize) -> Router {
    routes::routes::routes(max_chunk_bytes).with_state(state)
}
