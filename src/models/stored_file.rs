//! Represents an assembled artifact handed to durable storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for one stored file.
///
/// The payload lives on disk at `relative_path` beneath the storage root;
/// this struct only carries its bookkeeping.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredFile {
    /// Internal UUID, also the on-disk file stem.
    pub id: Uuid,

    /// Path relative to the storage root (e.g. `dicom/3f/a1/<uuid>.dcm`).
    pub relative_path: String,

    /// Filename the client uploaded under. Never used to build paths.
    pub original_filename: String,

    /// Storage category (top-level directory).
    pub category: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload.
    pub etag: String,

    pub created_at: DateTime<Utc>,
}
