//! Filesystem area holding raw chunk bytes for in-flight uploads.
//!
//! Layout: `root/{upload_id}/chunk_{index}`. Every path is derived from the
//! server-generated `Uuid` and the numeric index, never from client strings.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    time::SystemTime,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Name of the candidate file the assembler writes inside a session directory.
pub const ASSEMBLY_FILE: &str = "assembled.part";

#[derive(Debug, Error)]
pub enum ChunkWriteError {
    #[error("chunk checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of a successful chunk write.
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn upload_dir(&self, upload_id: &Uuid) -> PathBuf {
        self.root.join(upload_id.to_string())
    }

    pub fn chunk_path(&self, upload_id: &Uuid, index: u32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("chunk_{index}"))
    }

    pub fn assembly_path(&self, upload_id: &Uuid) -> PathBuf {
        self.upload_dir(upload_id).join(ASSEMBLY_FILE)
    }

    /// Create the directory for a new upload.
    ///
    /// Fails with `AlreadyExists` if the directory is present, which means
    /// the id was handed out twice.
    pub async fn create_upload_dir(&self, upload_id: &Uuid) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        let dir = self.upload_dir(upload_id);
        fs::create_dir(&dir).await?;
        Ok(dir)
    }

    /// Stream one chunk to disk.
    ///
    /// Bytes land in a temp file next to the final name, are hashed while
    /// streaming, and are renamed over `chunk_{index}` only once the optional
    /// `expected_sha256` matches. A previous copy of the same index survives
    /// any failure. The upload directory must already exist.
    pub async fn write_chunk<S, E>(
        &self,
        upload_id: &Uuid,
        index: u32,
        stream: S,
        expected_sha256: Option<&str>,
    ) -> Result<ChunkReceipt, ChunkWriteError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<io::Error> + Send,
    {
        let dir = self.upload_dir(upload_id);
        let tmp_path = dir.join(format!(".tmp-{index}-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut hasher = Sha256::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let err: io::Error = err.into();
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ChunkWriteError::Io(err));
                }
            };
            size += chunk.len() as u64;
            hasher.update(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&actual) {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ChunkWriteError::ChecksumMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }

        let final_path = self.chunk_path(upload_id, index);
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        debug!(
            "stored chunk {} ({} bytes) for upload {}",
            index, size, upload_id
        );

        Ok(ChunkReceipt {
            size,
            sha256: actual,
        })
    }

    pub async fn open_chunk(&self, upload_id: &Uuid, index: u32) -> io::Result<File> {
        File::open(self.chunk_path(upload_id, index)).await
    }

    /// Remove an upload directory and everything in it.
    ///
    /// Returns `Ok(false)` when there was nothing to remove.
    pub async fn remove_upload_dir(&self, upload_id: &Uuid) -> io::Result<bool> {
        match fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Upload directories present on disk with their modification times.
    ///
    /// Entries whose names are not UUIDs are ignored.
    pub async fn list_upload_dirs(&self) -> io::Result<Vec<(Uuid, SystemTime)>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                dirs.push((id, meta.modified()?));
            }
        }
        Ok(dirs)
    }
}
