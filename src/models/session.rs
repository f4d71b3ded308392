//! Upload session state machine.
//!
//! One `UploadSession` exists per in-flight upload. It records which chunk
//! indices have arrived and moves forward through
//! `initialized → uploading → {completed | error}`; any live state may be
//! cancelled. Nothing leaves `completed` or `cancelled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Initialized,
    Uploading,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Initialized => "initialized",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    /// `completed` and `cancelled` are sinks.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Cancelled)
    }
}

/// Rejected state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("upload is already {}", .0.as_str())]
    Terminal(UploadStatus),
    #[error("completion already in progress")]
    Completing,
    #[error("chunk writes still in progress")]
    WritesInFlight,
    #[error("chunk index {index} out of range (totalChunks = {total})")]
    ChunkOutOfRange { index: u32, total: u32 },
    #[error("missing chunks: received {received}/{total}")]
    Incomplete {
        received: u32,
        total: u32,
        missing: Vec<u32>,
    },
}

/// Parameters captured when a session is created.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub filename: String,
    pub declared_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub expected_checksum: Option<String>,
}

/// Server-side record of one logical upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Registry key; also the only input used to build chunk paths.
    pub upload_id: Uuid,

    /// Client-supplied name. Display and extension only.
    pub filename: String,

    /// Client-declared total length. Informational.
    pub declared_size: u64,

    /// Number of chunks, fixed at creation and always > 0.
    pub total_chunks: u32,

    /// Nominal chunk size. Informational.
    pub chunk_size: u64,

    /// Lowercase hex SHA-256 supplied at init, if any.
    pub expected_checksum: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,

    received_chunks: BTreeSet<u32>,
    status: UploadStatus,
    completing: bool,
    writers: u32,
}

/// Read-only progress snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub progress: f64,
}

/// What `begin_completion` hands to the caller that now owns the session.
#[derive(Debug, Clone)]
pub struct CompletionTicket {
    pub upload_id: Uuid,
    pub filename: String,
    pub total_chunks: u32,
    pub session_checksum: Option<String>,
}

impl UploadSession {
    pub fn new(upload_id: Uuid, params: NewSession) -> Self {
        let now = Utc::now();
        Self {
            upload_id,
            filename: params.filename,
            declared_size: params.declared_size,
            total_chunks: params.total_chunks,
            chunk_size: params.chunk_size,
            expected_checksum: params.expected_checksum,
            created_at: now,
            last_activity_at: now,
            received_chunks: BTreeSet::new(),
            status: UploadStatus::Initialized,
            completing: false,
            writers: 0,
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn is_completing(&self) -> bool {
        self.completing
    }

    /// A completion or at least one chunk write currently owns the session.
    pub fn is_busy(&self) -> bool {
        self.completing || self.writers > 0
    }

    pub fn received_count(&self) -> u32 {
        self.received_chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    /// Indices in `[0, total_chunks)` not yet received, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.received_count()) * 100.0 / f64::from(self.total_chunks)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            upload_id: self.upload_id,
            status: self.status,
            chunks_received: self.received_count(),
            total_chunks: self.total_chunks,
            progress: self.progress_percent(),
        }
    }

    /// Check that a chunk at `index` may be written right now.
    fn ensure_accepts_chunk(&self, index: u32) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if self.completing {
            return Err(TransitionError::Completing);
        }
        if index >= self.total_chunks {
            return Err(TransitionError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        Ok(())
    }

    /// Register a chunk write for `index` that is about to touch disk.
    ///
    /// Completion is refused until every registered writer has called
    /// `end_chunk_write`.
    pub fn begin_chunk_write(&mut self, index: u32) -> Result<(), TransitionError> {
        self.ensure_accepts_chunk(index)?;
        self.writers += 1;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    pub fn end_chunk_write(&mut self) {
        self.writers = self.writers.saturating_sub(1);
    }

    /// Mark `index` as received. Returns `true` when the index is new.
    ///
    /// Re-recording an index only refreshes `last_activity_at`.
    pub fn record_chunk(&mut self, index: u32) -> Result<bool, TransitionError> {
        self.ensure_accepts_chunk(index)?;
        let inserted = self.received_chunks.insert(index);
        self.last_activity_at = Utc::now();
        if self.status == UploadStatus::Initialized {
            self.status = UploadStatus::Uploading;
        }
        Ok(inserted)
    }

    /// Claim the session for a single `complete` call.
    pub fn begin_completion(&mut self) -> Result<CompletionTicket, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if self.completing {
            return Err(TransitionError::Completing);
        }
        if self.writers > 0 {
            return Err(TransitionError::WritesInFlight);
        }
        if !self.is_complete() {
            return Err(TransitionError::Incomplete {
                received: self.received_count(),
                total: self.total_chunks,
                missing: self.missing_chunks(),
            });
        }
        self.completing = true;
        self.last_activity_at = Utc::now();
        Ok(CompletionTicket {
            upload_id: self.upload_id,
            filename: self.filename.clone(),
            total_chunks: self.total_chunks,
            session_checksum: self.expected_checksum.clone(),
        })
    }

    /// Release the completion claim without changing status (I/O failure).
    pub fn abort_completion(&mut self) {
        self.completing = false;
        self.last_activity_at = Utc::now();
    }

    /// The assembled content did not match the expected digest.
    pub fn fail_completion(&mut self) {
        self.completing = false;
        self.last_activity_at = Utc::now();
        if !self.status.is_terminal() {
            self.status = UploadStatus::Error;
        }
    }

    pub fn finish_completion(&mut self) {
        self.completing = false;
        self.last_activity_at = Utc::now();
        if !self.status.is_terminal() {
            self.status = UploadStatus::Completed;
        }
    }

    /// Move to `cancelled` from any non-terminal state.
    ///
    /// Returns whether a `complete` call currently owns the session.
    pub fn cancel(&mut self) -> bool {
        if self.status != UploadStatus::Completed {
            self.status = UploadStatus::Cancelled;
        }
        self.last_activity_at = Utc::now();
        self.completing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u32) -> UploadSession {
        UploadSession::new(
            Uuid::new_v4(),
            NewSession {
                filename: "scan.bin".into(),
                declared_size: 30,
                total_chunks: total,
                chunk_size: 10,
                expected_checksum: None,
            },
        )
    }

    #[test]
    fn first_chunk_moves_to_uploading() {
        let mut s = session(3);
        assert_eq!(s.status(), UploadStatus::Initialized);
        assert!(s.record_chunk(1).unwrap());
        assert_eq!(s.status(), UploadStatus::Uploading);
        assert_eq!(s.received_count(), 1);
    }

    #[test]
    fn duplicate_chunk_is_not_double_counted() {
        let mut s = session(3);
        assert!(s.record_chunk(2).unwrap());
        assert!(!s.record_chunk(2).unwrap());
        assert_eq!(s.received_count(), 1);
        assert_eq!(s.missing_chunks(), vec![0, 1]);
    }

    #[test]
    fn out_of_range_chunk_rejected() {
        let mut s = session(3);
        assert_eq!(
            s.record_chunk(3),
            Err(TransitionError::ChunkOutOfRange { index: 3, total: 3 })
        );
        assert_eq!(s.received_count(), 0);
        assert_eq!(s.status(), UploadStatus::Initialized);
    }

    #[test]
    fn completion_requires_every_chunk() {
        let mut s = session(3);
        s.record_chunk(0).unwrap();
        s.record_chunk(2).unwrap();
        match s.begin_completion() {
            Err(TransitionError::Incomplete {
                received,
                total,
                missing,
            }) => {
                assert_eq!((received, total), (2, 3));
                assert_eq!(missing, vec![1]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!s.is_completing());
        assert_eq!(s.status(), UploadStatus::Uploading);
    }

    #[test]
    fn only_one_completion_claim() {
        let mut s = session(1);
        s.record_chunk(0).unwrap();
        let ticket = s.begin_completion().unwrap();
        assert_eq!(ticket.total_chunks, 1);
        assert_eq!(s.begin_completion().unwrap_err(), TransitionError::Completing);
        assert_eq!(s.record_chunk(0).unwrap_err(), TransitionError::Completing);
        s.finish_completion();
        assert_eq!(s.status(), UploadStatus::Completed);
        assert_eq!(
            s.begin_completion().unwrap_err(),
            TransitionError::Terminal(UploadStatus::Completed)
        );
    }

    #[test]
    fn failed_completion_can_be_retried() {
        let mut s = session(2);
        s.record_chunk(0).unwrap();
        s.record_chunk(1).unwrap();
        s.begin_completion().unwrap();
        s.fail_completion();
        assert_eq!(s.status(), UploadStatus::Error);

        // re-upload keeps the error status until the next attempt
        assert!(!s.record_chunk(1).unwrap());
        assert_eq!(s.status(), UploadStatus::Error);
        s.begin_completion().unwrap();
        s.finish_completion();
        assert_eq!(s.status(), UploadStatus::Completed);
    }

    #[test]
    fn cancel_is_terminal() {
        let mut s = session(2);
        s.record_chunk(0).unwrap();
        assert!(!s.cancel());
        assert_eq!(s.status(), UploadStatus::Cancelled);
        assert_eq!(
            s.record_chunk(1).unwrap_err(),
            TransitionError::Terminal(UploadStatus::Cancelled)
        );
    }

    #[test]
    fn cancel_reports_inflight_completion() {
        let mut s = session(1);
        s.record_chunk(0).unwrap();
        s.begin_completion().unwrap();
        assert!(s.cancel());
        s.finish_completion();
        assert_eq!(s.status(), UploadStatus::Cancelled);
    }

    #[test]
    fn pending_writer_blocks_completion() {
        let mut s = session(1);
        s.record_chunk(0).unwrap();
        s.begin_chunk_write(0).unwrap();
        assert!(s.is_busy());
        assert_eq!(
            s.begin_completion().unwrap_err(),
            TransitionError::WritesInFlight
        );

        s.end_chunk_write();
        assert!(!s.is_busy());
        s.begin_completion().unwrap();
        assert_eq!(
            s.begin_chunk_write(0).unwrap_err(),
            TransitionError::Completing
        );
    }

    #[test]
    fn progress_percentage() {
        let mut s = session(4);
        s.record_chunk(0).unwrap();
        let p = s.progress();
        assert_eq!(p.chunks_received, 1);
        assert_eq!(p.total_chunks, 4);
        assert!((p.progress - 25.0).abs() < f64::EPSILON);
    }
}
