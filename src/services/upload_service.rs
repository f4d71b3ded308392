//! src/services/upload_service.rs
//!
//! UploadService: the chunked upload orchestrator. It owns the chunk store,
//! consults the injected session registry, runs assembly and checksum
//! verification, and hands verified files to a `FileStorage` collaborator.

use crate::{
    models::session::{NewSession, Progress, TransitionError, UploadSession, UploadStatus},
    services::{
        assembler::{self, normalize_sha256},
        chunk_store::{ChunkStore, ChunkWriteError},
        file_storage::{ByteStream, FileStorage, StorageError},
        registry::{RegistryError, SessionHandle, SessionRegistry, lock_session},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::{
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on `totalChunks` accepted at init.
pub const MAX_TOTAL_CHUNKS: u32 = 100_000;

pub const DEFAULT_CATEGORY: &str = "dicom";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("storage I/O error: {0}")]
    StorageIo(#[source] io::Error),
    #[error("missing chunks: received {received}/{total}")]
    IncompleteUpload {
        received: u32,
        total: u32,
        missing: Vec<u32>,
    },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        chunk_index: Option<u32>,
        expected: String,
        actual: String,
    },
    #[error("{0}")]
    ConflictingOperation(String),
    #[error("upload id `{0}` was generated twice")]
    DuplicateUploadId(Uuid),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::StorageIo(err)
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(err) => UploadError::StorageIo(err),
            other => UploadError::StorageIo(io::Error::other(other)),
        }
    }
}

/// Parameters for `init`.
#[derive(Debug, Clone)]
pub struct InitUpload {
    pub filename: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub sha256: Option<String>,
}

/// Per-chunk metadata sent alongside the bytes.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChunkProgress {
    pub chunk_index: u32,
    /// Hex SHA-256 of the bytes written for this chunk.
    pub sha256: String,
    pub progress: Progress,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub upload_id: Uuid,
    pub final_path: String,
    pub file_size: u64,
    pub sha256: String,
    pub checksum_valid: bool,
}

/// Counts from one idle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub orphan_dirs: usize,
}

#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// Largest accepted `fileSize` at init; 0 disables the check.
    pub max_file_size: u64,
    /// Storage category finished uploads are filed under.
    pub category: String,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_size: 500 * 1024 * 1024,
            category: DEFAULT_CATEGORY.to_string(),
        }
    }
}

/// Chunked upload orchestrator.
///
/// Cheap to clone; all clones share the same registry, chunk area and
/// storage collaborator.
#[derive(Clone)]
pub struct UploadService {
    registry: Arc<SessionRegistry>,
    chunks: ChunkStore,
    storage: Arc<dyn FileStorage>,
    limits: UploadLimits,
}

impl UploadService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        chunks: ChunkStore,
        storage: Arc<dyn FileStorage>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            registry,
            chunks,
            storage,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Open a new upload session and its chunk directory.
    pub async fn init(&self, req: InitUpload) -> UploadResult<Progress> {
        let filename = req.filename.trim();
        if filename.is_empty() {
            return Err(UploadError::InvalidRequest("filename is required".into()));
        }
        if req.total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "totalChunks must be greater than zero".into(),
            ));
        }
        if req.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(UploadError::InvalidRequest(format!(
                "totalChunks {} exceeds the limit of {}",
                req.total_chunks, MAX_TOTAL_CHUNKS
            )));
        }
        if self.limits.max_file_size > 0 && req.file_size > self.limits.max_file_size {
            return Err(UploadError::InvalidRequest(format!(
                "fileSize {} exceeds the limit of {} bytes",
                req.file_size, self.limits.max_file_size
            )));
        }
        let expected_checksum = parse_checksum(req.sha256.as_deref())?;

        let upload_id = Uuid::new_v4();
        self.chunks
            .create_upload_dir(&upload_id)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::AlreadyExists => UploadError::DuplicateUploadId(upload_id),
                _ => UploadError::StorageIo(err),
            })?;

        let session = UploadSession::new(
            upload_id,
            NewSession {
                filename: filename.to_string(),
                declared_size: req.file_size,
                total_chunks: req.total_chunks,
                chunk_size: req.chunk_size,
                expected_checksum,
            },
        );
        let handle = self.registry.create(session).map_err(|err| match err {
            RegistryError::Duplicate(id) => UploadError::DuplicateUploadId(id),
        })?;

        info!(
            "Initialized upload {} ({}, {} chunks)",
            upload_id, filename, req.total_chunks
        );
        let progress = lock_session(&handle).progress();
        Ok(progress)
    }

    /// Store one chunk and mark it received.
    ///
    /// Re-sending an index overwrites the stored bytes; the received count
    /// only grows for indices not seen before.
    pub async fn upload_chunk<S, E>(
        &self,
        upload_id: &str,
        meta: ChunkMeta,
        content: S,
    ) -> UploadResult<ChunkProgress>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<io::Error> + Send,
    {
        let id = parse_upload_id(upload_id)?;
        let expected = parse_checksum(meta.sha256.as_deref())?;
        let handle = self.session(&id)?;
        let index = meta.chunk_index;

        let mut claim = {
            let mut session = lock_session(&handle);
            if meta.total_chunks != session.total_chunks {
                return Err(UploadError::InvalidRequest(format!(
                    "totalChunks {} does not match the session value {}",
                    meta.total_chunks, session.total_chunks
                )));
            }
            session
                .begin_chunk_write(index)
                .map_err(|err| transition_error(&id, err))?;
            WriteClaim::new(handle.clone())
        };

        let receipt = self
            .chunks
            .write_chunk(&id, index, content, expected.as_deref())
            .await
            .map_err(|err| match err {
                ChunkWriteError::ChecksumMismatch { expected, actual } => {
                    UploadError::ChecksumMismatch {
                        chunk_index: Some(index),
                        expected,
                        actual,
                    }
                }
                ChunkWriteError::Io(err)
                    if err.kind() == ErrorKind::NotFound && !self.registry.contains(&id) =>
                {
                    UploadError::SessionNotFound(id.to_string())
                }
                ChunkWriteError::Io(err) => UploadError::StorageIo(err),
            })?;

        let mut session = lock_session(&handle);
        claim.release(&mut session);
        let inserted = session
            .record_chunk(index)
            .map_err(|err| transition_error(&id, err))?;
        debug!(
            "Received chunk {}/{} for upload {} ({} bytes, new: {})",
            index + 1,
            session.total_chunks,
            id,
            receipt.size,
            inserted
        );

        Ok(ChunkProgress {
            chunk_index: index,
            sha256: receipt.sha256,
            progress: session.progress(),
        })
    }

    /// Assemble, verify and store a fully received upload.
    ///
    /// `expected_sha256` overrides the checksum given at init.
    pub async fn complete(
        &self,
        upload_id: &str,
        expected_sha256: Option<String>,
    ) -> UploadResult<CompletedUpload> {
        let id = parse_upload_id(upload_id)?;
        let call_checksum = parse_checksum(expected_sha256.as_deref())?;
        let handle = self.session(&id)?;

        let ticket = lock_session(&handle)
            .begin_completion()
            .map_err(|err| transition_error(&id, err))?;

        // From here on this call owns the session until it releases the claim.
        let assembly = match assembler::assemble(&self.chunks, &id, ticket.total_chunks).await {
            Ok(assembly) => assembly,
            Err(err) => {
                if self.cleanup_if_cancelled(&id, &handle).await {
                    return Err(UploadError::SessionNotFound(id.to_string()));
                }
                warn!("Assembly failed for upload {}: {}", id, err);
                lock_session(&handle).abort_completion();
                return Err(UploadError::StorageIo(err));
            }
        };
        if self.cleanup_if_cancelled(&id, &handle).await {
            return Err(UploadError::SessionNotFound(id.to_string()));
        }

        if let Some(expected) = call_checksum.or(ticket.session_checksum) {
            if expected != assembly.sha256 {
                warn!(
                    "Checksum mismatch for upload {}: expected {}, got {}",
                    id, expected, assembly.sha256
                );
                remove_quietly(&assembly.path).await;
                lock_session(&handle).fail_completion();
                return Err(UploadError::ChecksumMismatch {
                    chunk_index: None,
                    expected,
                    actual: assembly.sha256,
                });
            }
        }

        let stored = match File::open(&assembly.path).await {
            Ok(file) => {
                let content: ByteStream = Box::pin(ReaderStream::new(file));
                self.storage
                    .store(content, &ticket.filename, &self.limits.category)
                    .await
                    .map_err(UploadError::from)
            }
            Err(err) => Err(UploadError::StorageIo(err)),
        };
        remove_quietly(&assembly.path).await;
        let stored = match stored {
            Ok(record) if u64::try_from(record.size_bytes).ok() == Some(assembly.size) => {
                Ok(record.relative_path)
            }
            Ok(record) => {
                self.discard_stored(&record.relative_path, &id).await;
                Err(UploadError::StorageIo(io::Error::other(format!(
                    "stored {} bytes, assembled {}",
                    record.size_bytes, assembly.size
                ))))
            }
            Err(err) => Err(err),
        };
        let final_path = match stored {
            Ok(path) => path,
            Err(err) => {
                if self.cleanup_if_cancelled(&id, &handle).await {
                    return Err(UploadError::SessionNotFound(id.to_string()));
                }
                warn!("Storing upload {} failed: {}", id, err);
                lock_session(&handle).abort_completion();
                return Err(err);
            }
        };

        let cancelled = {
            let mut session = lock_session(&handle);
            session.finish_completion();
            session.status() == UploadStatus::Cancelled
        };
        if cancelled {
            // cancel arrived while the artifact was being stored
            self.discard_stored(&final_path, &id).await;
            self.remove_chunks(&id).await;
            return Err(UploadError::SessionNotFound(id.to_string()));
        }

        self.registry.remove(&id);
        self.remove_chunks(&id).await;
        info!(
            "Upload {} completed: {} ({} bytes)",
            id, final_path, assembly.size
        );

        Ok(CompletedUpload {
            upload_id: id,
            final_path,
            file_size: assembly.size,
            sha256: assembly.sha256,
            checksum_valid: true,
        })
    }

    /// Drop a session and its chunks. Unknown or malformed ids are a no-op.
    pub async fn cancel(&self, upload_id: &str) {
        match Uuid::parse_str(upload_id) {
            Ok(id) => self.cancel_id(&id).await,
            Err(_) => debug!("Ignoring cancel for malformed upload id {:?}", upload_id),
        }
    }

    async fn cancel_id(&self, id: &Uuid) {
        let completing = match self.registry.remove(id) {
            Some(handle) => lock_session(&handle).cancel(),
            None => false,
        };
        if completing {
            info!("Upload {} cancelled during completion", id);
            return;
        }
        self.remove_chunks(id).await;
        info!("Upload {} cancelled", id);
    }

    /// Read-only progress snapshot.
    pub fn status(&self, upload_id: &str) -> UploadResult<Progress> {
        let id = parse_upload_id(upload_id)?;
        let handle = self.session(&id)?;
        let progress = lock_session(&handle).progress();
        Ok(progress)
    }

    /// Cancel sessions idle for longer than `ttl` and remove chunk
    /// directories with no session that have not changed within `ttl`.
    pub async fn sweep_idle(&self, ttl: Duration) -> UploadResult<SweepReport> {
        let mut report = SweepReport::default();
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(report);
        };

        for id in self.registry.idle_since(cutoff) {
            // re-checked under the lock; activity since the snapshot wins
            let Some(handle) = self.registry.remove_if_idle(&id, cutoff) else {
                continue;
            };
            info!("Expiring idle upload {}", id);
            lock_session(&handle).cancel();
            self.remove_chunks(&id).await;
            report.expired_sessions += 1;
        }

        let Some(dir_cutoff) = SystemTime::now().checked_sub(ttl) else {
            return Ok(report);
        };
        for (id, modified) in self.chunks.list_upload_dirs().await? {
            if modified >= dir_cutoff || self.registry.contains(&id) {
                continue;
            }
            match self.chunks.remove_upload_dir(&id).await {
                Ok(true) => {
                    info!("Removed orphaned chunk directory for {}", id);
                    report.orphan_dirs += 1;
                }
                Ok(false) => {}
                Err(err) => warn!("Failed to remove orphaned chunks for {}: {}", id, err),
            }
        }

        Ok(report)
    }

    fn session(&self, id: &Uuid) -> UploadResult<SessionHandle> {
        self.registry
            .get(id)
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// If the session was cancelled while this call owned it, release the
    /// claim and delete the chunks on the canceller's behalf.
    async fn cleanup_if_cancelled(&self, id: &Uuid, handle: &SessionHandle) -> bool {
        let cancelled = {
            let mut session = lock_session(handle);
            if session.status() == UploadStatus::Cancelled {
                session.abort_completion();
                true
            } else {
                false
            }
        };
        if cancelled {
            self.remove_chunks(id).await;
        }
        cancelled
    }

    async fn discard_stored(&self, relative_path: &str, id: &Uuid) {
        if let Err(err) = self.storage.delete(relative_path).await {
            warn!(
                "Failed to discard {} for upload {}: {}",
                relative_path, id, err
            );
        }
    }

    async fn remove_chunks(&self, id: &Uuid) {
        if let Err(err) = self.chunks.remove_upload_dir(id).await {
            warn!("Failed to delete chunks for upload {}: {}", id, err);
        }
    }
}

/// One registered chunk write. Released under the session lock on success;
/// dropping it unreleased (error or cancelled request) releases it too.
struct WriteClaim {
    handle: SessionHandle,
    released: bool,
}

impl WriteClaim {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            released: false,
        }
    }

    /// `session` must be the guard of this claim's handle.
    fn release(&mut self, session: &mut UploadSession) {
        if !self.released {
            session.end_chunk_write();
            self.released = true;
        }
    }
}

impl Drop for WriteClaim {
    fn drop(&mut self) {
        if !self.released {
            lock_session(&self.handle).end_chunk_write();
        }
    }
}

fn parse_upload_id(upload_id: &str) -> UploadResult<Uuid> {
    Uuid::parse_str(upload_id).map_err(|_| UploadError::SessionNotFound(upload_id.to_string()))
}

/// Empty values count as absent; anything else must be 64 hex characters.
fn parse_checksum(value: Option<&str>) -> UploadResult<Option<String>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => normalize_sha256(raw).map(Some).ok_or_else(|| {
            UploadError::InvalidRequest(format!(
                "sha256 must be 64 hexadecimal characters, got `{}`",
                raw
            ))
        }),
    }
}

fn transition_error(id: &Uuid, err: TransitionError) -> UploadError {
    match err {
        TransitionError::Terminal(_) => UploadError::SessionNotFound(id.to_string()),
        TransitionError::Completing => UploadError::ConflictingOperation(format!(
            "completion of upload {} is already in progress",
            id
        )),
        TransitionError::WritesInFlight => UploadError::ConflictingOperation(format!(
            "chunks of upload {} are still being written",
            id
        )),
        TransitionError::ChunkOutOfRange { .. } => UploadError::InvalidRequest(err.to_string()),
        TransitionError::Incomplete {
            received,
            total,
            missing,
        } => UploadError::IncompleteUpload {
            received,
            total,
            missing,
        },
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            debug!("failed to remove {}: {}", path.display(), err);
        }
    }
}
