#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, stream};
use ingest_store::{
    db,
    models::stored_file::StoredFile,
    services::{
        chunk_store::ChunkStore,
        file_storage::{ByteStream, FileStorage, LocalFileStorage, StorageError, StorageResult},
        registry::SessionRegistry,
        upload_service::{ChunkMeta, InitUpload, UploadLimits, UploadService},
    },
};
use sha2::{Digest, Sha256};
use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// `LocalFileStorage` wrapper that counts calls, can hold `store` until the
/// test releases it, and can fail the next `store`.
pub struct RecordingStorage {
    pub inner: LocalFileStorage,
    pub stores: AtomicUsize,
    pub deletes: AtomicUsize,
    gated: AtomicBool,
    fail_next: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl RecordingStorage {
    pub fn new(inner: LocalFileStorage) -> Self {
        Self {
            inner,
            stores: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            fail_next: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Make the next `store` calls wait for `release.notify_one()`.
    pub fn hold_stores(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Make the next `store` call fail after consuming its gate.
    pub fn fail_next_store(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStorage for RecordingStorage {
    async fn store(
        &self,
        content: ByteStream,
        filename: &str,
        category: &str,
    ) -> StorageResult<StoredFile> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::other("disk hiccup")));
        }
        self.inner.store(content, filename, category).await
    }

    async fn exists(&self, relative_path: &str) -> StorageResult<bool> {
        self.inner.exists(relative_path).await
    }

    async fn delete(&self, relative_path: &str) -> StorageResult<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(relative_path).await
    }

    fn full_path(&self, relative_path: &str) -> StorageResult<PathBuf> {
        self.inner.full_path(relative_path)
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub service: UploadService,
    pub storage: Arc<RecordingStorage>,
    pub db: Arc<sqlx::SqlitePool>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_limits(UploadLimits::default()).await
    }

    pub async fn with_limits(limits: UploadLimits) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db = Arc::new(db::connect_in_memory().await.expect("in-memory db"));
        let local = LocalFileStorage::new(db.clone(), dir.path().join("files"));
        local.init(&[limits.category.as_str()]).await.expect("init storage");
        let storage = Arc::new(RecordingStorage::new(local));
        let service = UploadService::new(
            Arc::new(SessionRegistry::new()),
            ChunkStore::new(dir.path().join("chunks")),
            storage.clone(),
            limits,
        );
        Self {
            dir,
            service,
            storage,
            db,
        }
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Open a session and return its id as a string.
    pub async fn init(&self, filename: &str, total_chunks: u32) -> String {
        self.service
            .init(InitUpload {
                filename: filename.into(),
                file_size: 0,
                total_chunks,
                chunk_size: 0,
                sha256: None,
            })
            .await
            .expect("init")
            .upload_id
            .to_string()
    }

    pub async fn send(&self, upload_id: &str, index: u32, total: u32, data: &[u8]) {
        self.service
            .upload_chunk(upload_id, meta(index, total), body(data))
            .await
            .expect("upload chunk");
    }
}

pub fn meta(chunk_index: u32, total_chunks: u32) -> ChunkMeta {
    ChunkMeta {
        chunk_index,
        total_chunks,
        sha256: None,
    }
}

pub fn body(data: &[u8]) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + use<> {
    stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
}

/// Hand-off points for a body stream that blocks until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// A chunk body that signals `gate.entered` when first polled and yields
/// `data` only after `gate.release` fires.
pub fn gated_body(
    data: &[u8],
    gate: Arc<Gate>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + use<> {
    let data = Bytes::copy_from_slice(data);
    stream::once(async move {
        gate.entered.notify_one();
        gate.release.notified().await;
        Ok(data)
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
