//! Core data models for the chunked upload service.
//!
//! `session` holds the in-memory upload state machine; `stored_file` maps
//! the `stored_files` table via `sqlx::FromRow`.

pub mod session;
pub mod stored_file;
