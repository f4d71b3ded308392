//! Sequential chunk assembly with a streaming SHA-256.
//!
//! Chunks are read in ascending index order through one fixed buffer and
//! written to a candidate file while the digest accumulates, so memory use
//! does not grow with the size of the upload.

use crate::services::chunk_store::ChunkStore;
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::info;
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A fully assembled candidate file.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the whole content.
    pub sha256: String,
}

/// Concatenate `chunk_0 … chunk_{total_chunks-1}` of `upload_id` into the
/// session's assembly file.
///
/// A missing chunk file surfaces as `NotFound`; the partial candidate is
/// removed on any error. Chunk files are never touched.
pub async fn assemble(
    store: &ChunkStore,
    upload_id: &Uuid,
    total_chunks: u32,
) -> io::Result<Assembly> {
    let dest = store.assembly_path(upload_id);
    match write_candidate(store, upload_id, total_chunks, &dest).await {
        Ok((size, sha256)) => {
            info!(
                "assembled {} chunks ({} bytes) for upload {}",
                total_chunks, size, upload_id
            );
            Ok(Assembly {
                path: dest,
                size,
                sha256,
            })
        }
        Err(err) => {
            let _ = fs::remove_file(&dest).await;
            Err(err)
        }
    }
}

async fn write_candidate(
    store: &ChunkStore,
    upload_id: &Uuid,
    total_chunks: u32,
    dest: &Path,
) -> io::Result<(u64, String)> {
    let mut out = File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut size: u64 = 0;

    for index in 0..total_chunks {
        let mut chunk = store.open_chunk(upload_id, index).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                io::Error::new(
                    ErrorKind::NotFound,
                    format!("chunk {index} missing on disk"),
                )
            } else {
                err
            }
        })?;
        loop {
            let n = chunk.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

/// Accept 64 hex characters; normalise to lowercase.
pub fn normalize_sha256(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trimmed.to_ascii_lowercase())
    } else {
        None
    }
}
