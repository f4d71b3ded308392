use crate::services::upload_service::UploadService;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,

    /// SQLite pool backing stored-file metadata, probed by `/readyz`.
    pub db: Arc<SqlitePool>,

    /// Directory probed by `/readyz` for disk health.
    pub storage_dir: PathBuf,
}
