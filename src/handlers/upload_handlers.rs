//! HTTP handlers for the chunked upload lifecycle.
//! Request parsing and response shaping live here; session bookkeeping and
//! file handling are delegated to `UploadService`.

use crate::{
    errors::AppError,
    models::session::{Progress, UploadStatus},
    services::upload_service::{ChunkMeta, ChunkProgress, InitUpload, UploadError},
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{
        Multipart, Path, State,
        multipart::{Field, MultipartError},
    },
};
use futures::{StreamExt, TryStreamExt, future, pin_mut, stream};
use serde::{Deserialize, Serialize};
use std::io;
use tracing::debug;
use uuid::Uuid;

/// Body of `POST /uploads/init`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub filename: Option<String>,
    pub file_size: Option<i64>,
    pub total_chunks: Option<i64>,
    pub chunk_size: Option<i64>,
    pub sha256: Option<String>,
}

/// Optional body of `POST /uploads/{uploadId}/complete`.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteUploadRequest {
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub total_chunks: u32,
    pub progress: f64,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceivedResponse {
    pub upload_id: Uuid,
    pub status: &'static str,
    pub chunk_index: u32,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub progress: f64,
    pub sha256: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub final_path: String,
    pub file_size: u64,
    pub checksum_valid: bool,
    pub sha256: String,
    pub progress: f64,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadResponse {
    pub upload_id: String,
    pub status: UploadStatus,
    pub message: String,
}

/// `POST /uploads/init`
pub async fn init_upload(
    State(state): State<AppState>,
    Json(req): Json<InitUploadRequest>,
) -> Result<Json<InitUploadResponse>, AppError> {
    let filename = req
        .filename
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("filename is required"))?;
    let total_chunks = positive_u32("totalChunks", req.total_chunks.unwrap_or(0))?;
    let file_size = non_negative("fileSize", req.file_size.unwrap_or(0))?;
    let chunk_size = non_negative("chunkSize", req.chunk_size.unwrap_or(0))?;

    let progress = state
        .uploads
        .init(InitUpload {
            filename,
            file_size,
            total_chunks,
            chunk_size,
            sha256: req.sha256,
        })
        .await?;

    Ok(Json(InitUploadResponse {
        upload_id: progress.upload_id,
        status: progress.status,
        total_chunks: progress.total_chunks,
        progress: progress.progress,
        message: "Upload session created".into(),
    }))
}

/// `PUT /uploads/{uploadId}/chunk`
///
/// Multipart fields: `file` (chunk bytes), `chunkIndex`, `totalChunks` and an
/// optional `sha256` of the chunk. When `chunkIndex` and `totalChunks` come
/// before `file`, the bytes are streamed straight to disk; otherwise `file` is
/// buffered until the metadata has been read. A `sha256` sent after a
/// streamed `file` is checked against the digest of what was written.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<ChunkReceivedResponse>, AppError> {
    let mut chunk_index: Option<u32> = None;
    let mut total_chunks: Option<u32> = None;
    let mut sha256: Option<String> = None;
    let mut late_sha256: Option<String> = None;
    let mut buffered: Option<Bytes> = None;
    let mut streamed: Option<ChunkProgress> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(&err))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if streamed.is_some() || buffered.is_some() {
                    return Err(AppError::bad_request("only one file field is allowed"));
                }
                match (chunk_index, total_chunks) {
                    (Some(index), Some(total)) => {
                        let meta = ChunkMeta {
                            chunk_index: index,
                            total_chunks: total,
                            sha256: sha256.clone(),
                        };
                        streamed = Some(stream_chunk(&state, &upload_id, meta, field).await?);
                    }
                    _ => {
                        let bytes = field.bytes().await.map_err(|err| multipart_error(&err))?;
                        buffered = Some(bytes);
                    }
                }
            }
            "chunkIndex" => {
                let text = field.text().await.map_err(|err| multipart_error(&err))?;
                let value = parse_int("chunkIndex", &text)?;
                let index = u32::try_from(value)
                    .map_err(|_| AppError::bad_request(format!("Invalid chunkIndex {}", value)))?;
                chunk_index = Some(index);
            }
            "totalChunks" => {
                let text = field.text().await.map_err(|err| multipart_error(&err))?;
                total_chunks = Some(positive_u32("totalChunks", parse_int("totalChunks", &text)?)?);
            }
            "sha256" => {
                let text = field.text().await.map_err(|err| multipart_error(&err))?;
                if streamed.is_some() {
                    late_sha256 = Some(text);
                } else {
                    sha256 = Some(text);
                }
            }
            other => debug!("ignoring multipart field {:?}", other),
        }
    }

    let received = match (streamed, buffered) {
        (Some(received), _) => received,
        (None, Some(file)) => {
            if file.is_empty() {
                return Err(AppError::bad_request("Chunk file is empty"));
            }
            let chunk_index =
                chunk_index.ok_or_else(|| AppError::bad_request("chunkIndex is required"))?;
            let total_chunks =
                total_chunks.ok_or_else(|| AppError::bad_request("totalChunks is required"))?;
            let content = stream::once(future::ready(Ok::<_, io::Error>(file)));
            state
                .uploads
                .upload_chunk(
                    &upload_id,
                    ChunkMeta {
                        chunk_index,
                        total_chunks,
                        sha256,
                    },
                    content,
                )
                .await?
        }
        (None, None) => return Err(AppError::bad_request("file field is required")),
    };

    if let Some(expected) = late_sha256 {
        let expected = expected.trim().to_ascii_lowercase();
        if expected != received.sha256 {
            return Err(UploadError::ChecksumMismatch {
                chunk_index: Some(received.chunk_index),
                expected,
                actual: received.sha256,
            }
            .into());
        }
    }

    let progress = received.progress;
    Ok(Json(ChunkReceivedResponse {
        upload_id: progress.upload_id,
        status: "chunk_received",
        chunk_index: received.chunk_index,
        chunks_received: progress.chunks_received,
        total_chunks: progress.total_chunks,
        progress: progress.progress,
        sha256: received.sha256,
        message: format!(
            "Chunk {}/{} received",
            received.chunk_index + 1,
            progress.total_chunks
        ),
    }))
}

/// Stream one multipart `file` field into the chunk store.
async fn stream_chunk(
    state: &AppState,
    upload_id: &str,
    meta: ChunkMeta,
    field: Field<'_>,
) -> Result<ChunkProgress, AppError> {
    let content = field
        .map_err(io::Error::other)
        .try_filter(|bytes| future::ready(!bytes.is_empty()))
        .peekable();
    pin_mut!(content);
    if content.as_mut().peek().await.is_none() {
        return Err(AppError::bad_request("Chunk file is empty"));
    }

    state
        .uploads
        .upload_chunk(upload_id, meta, content)
        .await
        .map_err(|err| {
            // body errors (size limit, truncation) keep their multipart status
            let rejection = match &err {
                UploadError::StorageIo(io_err) => io_err
                    .get_ref()
                    .and_then(|inner| inner.downcast_ref::<MultipartError>())
                    .map(multipart_error),
                _ => None,
            };
            rejection.unwrap_or_else(|| err.into())
        })
}

/// `POST /uploads/{uploadId}/complete`
///
/// The JSON body is optional; an empty body completes against the checksum
/// given at init, if any.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    body: Bytes,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    let req: CompleteUploadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CompleteUploadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid JSON body: {}", err)))?
    };

    let completed = state.uploads.complete(&upload_id, req.sha256).await?;

    Ok(Json(CompleteUploadResponse {
        upload_id: completed.upload_id,
        status: UploadStatus::Completed,
        final_path: completed.final_path,
        file_size: completed.file_size,
        checksum_valid: completed.checksum_valid,
        sha256: completed.sha256,
        progress: 100.0,
        message: "Upload completed successfully".into(),
    }))
}

/// `DELETE /uploads/{uploadId}`. Always succeeds.
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Json<CancelUploadResponse> {
    state.uploads.cancel(&upload_id).await;
    Json(CancelUploadResponse {
        upload_id,
        status: UploadStatus::Cancelled,
        message: "Upload cancelled and chunks deleted".into(),
    })
}

/// `GET /uploads/{uploadId}/status`
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<Progress>, AppError> {
    Ok(Json(state.uploads.status(&upload_id)?))
}

fn multipart_error(err: &MultipartError) -> AppError {
    AppError::new(err.status(), format!("invalid multipart body: {}", err.body_text()))
}

fn parse_int(field: &str, text: &str) -> Result<i64, AppError> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| AppError::bad_request(format!("Invalid {} `{}`", field, text)))
}

fn positive_u32(field: &str, value: i64) -> Result<u32, AppError> {
    match u32::try_from(value) {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(AppError::bad_request(format!(
            "Invalid {}: must be a positive integer",
            field
        ))),
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64, AppError> {
    u64::try_from(value)
        .map_err(|_| AppError::bad_request(format!("Invalid {}: must not be negative", field)))
}
