//! src/services/file_storage.rs
//!
//! Durable storage for assembled uploads. The upload orchestrator only sees
//! the `FileStorage` trait; `LocalFileStorage` keeps payloads on local disk
//! sharded beneath `root/{category}/{shard}/{shard}/{uuid}{.ext}` and records
//! one metadata row per file in SQLite.

use crate::models::stored_file::StoredFile;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info};
use uuid::Uuid;

/// A boxed stream of bytes handed to `FileStorage::store`.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path `{0}` resolves outside the storage root")]
    OutsideRoot(String),
    #[error("invalid storage category `{0}`")]
    InvalidCategory(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Sink for fully verified uploads.
///
/// Paths exchanged through this trait are relative to the storage root.
/// Implementations must refuse any path that would resolve outside it.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Persist `content` and return the record describing it.
    ///
    /// `filename` is the client-supplied name and may only influence the
    /// stored file's extension.
    async fn store(
        &self,
        content: ByteStream,
        filename: &str,
        category: &str,
    ) -> StorageResult<StoredFile>;

    async fn exists(&self, relative_path: &str) -> StorageResult<bool>;

    /// Returns `false` when nothing was stored at `relative_path`.
    async fn delete(&self, relative_path: &str) -> StorageResult<bool>;

    fn full_path(&self, relative_path: &str) -> StorageResult<PathBuf>;
}

const MAX_CATEGORY_LEN: usize = 32;
const MAX_EXTENSION_LEN: usize = 16;

/// Local-disk `FileStorage` with SQLite bookkeeping.
#[derive(Clone)]
pub struct LocalFileStorage {
    /// Shared SQLite connection pool used for metadata rows.
    pub db: Arc<SqlitePool>,

    /// Directory every stored path is relative to.
    pub root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(db: Arc<SqlitePool>, root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            root: root.into(),
        }
    }

    /// Create the root and the given category directories.
    pub async fn init(&self, categories: &[&str]) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await?;
        for category in categories {
            ensure_category_safe(category)?;
            let dir = self.root.join(category);
            if !fs::try_exists(&dir).await? {
                fs::create_dir_all(&dir).await?;
                info!("Created storage subdirectory {}", dir.display());
            }
        }
        Ok(())
    }

    /// Resolve a relative path against the root, rejecting anything that
    /// could climb out of it.
    fn resolve(&self, relative_path: &str) -> StorageResult<PathBuf> {
        if relative_path.is_empty()
            || relative_path
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\')
        {
            return Err(StorageError::OutsideRoot(relative_path.to_string()));
        }
        let mut resolved = self.root.clone();
        for component in Path::new(relative_path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::OutsideRoot(relative_path.to_string()));
                }
            }
        }
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(StorageError::OutsideRoot(relative_path.to_string()));
        }
        Ok(resolved)
    }

    /// Two-level shard identifiers from MD5(category/id).
    fn file_shards(category: &str, id: &Uuid) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", category, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn relative_path_for(category: &str, id: &Uuid, filename: &str) -> String {
        let (shard_a, shard_b) = Self::file_shards(category, id);
        let ext = safe_extension(filename)
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        format!("{category}/{shard_a}/{shard_b}/{id}{ext}")
    }

    /// Remove empty directories from `start` upward, stopping at `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    /// Stream `content` to a temp file, fsync, rename into place, then
    /// record the metadata row. The payload is removed if the row insert
    /// fails.
    async fn store(
        &self,
        mut content: ByteStream,
        filename: &str,
        category: &str,
    ) -> StorageResult<StoredFile> {
        ensure_category_safe(category)?;
        let id = Uuid::new_v4();
        let relative_path = Self::relative_path_for(category, &id, filename);
        let file_path = self.resolve(&relative_path)?;

        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "stored file path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = content.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let record = StoredFile {
            id,
            relative_path,
            original_filename: filename.to_string(),
            category: category.to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            created_at: Utc::now(),
        };
        let insert = sqlx::query(
            "INSERT INTO stored_files (
                id, relative_path, original_filename, category, size_bytes, etag, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.relative_path)
        .bind(&record.original_filename)
        .bind(&record.category)
        .bind(record.size_bytes)
        .bind(&record.etag)
        .bind(record.created_at)
        .execute(&*self.db)
        .await;

        match insert {
            Ok(_) => {
                debug!("stored file {} ({} bytes)", record.relative_path, size_bytes);
                Ok(record)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn exists(&self, relative_path: &str) -> StorageResult<bool> {
        let path = self.resolve(relative_path)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, relative_path: &str) -> StorageResult<bool> {
        let path = self.resolve(relative_path)?;

        sqlx::query("DELETE FROM stored_files WHERE relative_path = ?")
            .bind(relative_path)
            .execute(&*self.db)
            .await?;

        let removed = match fs::remove_file(&path).await {
            Ok(_) => {
                debug!("removed stored file {}", path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(StorageError::Io(err)),
        };

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.root).await;
        }
        Ok(removed)
    }

    fn full_path(&self, relative_path: &str) -> StorageResult<PathBuf> {
        self.resolve(relative_path)
    }
}

/// Categories become directory names: lowercase ASCII, digits, `-`, `_`.
pub fn ensure_category_safe(category: &str) -> StorageResult<()> {
    let valid = !category.is_empty()
        && category.len() <= MAX_CATEGORY_LEN
        && category
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidCategory(category.to_string()))
    }
}

/// Lowercased extension of a client filename, if it is short and
/// alphanumeric. Anything else is dropped.
fn safe_extension(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
