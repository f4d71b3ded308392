mod common;

use common::{Gate, TestEnv, body, gated_body, meta, sha256_hex};
use ingest_store::{
    models::session::UploadStatus,
    services::{
        file_storage::FileStorage,
        registry::lock_session,
        upload_service::{ChunkMeta, InitUpload, UploadError, UploadLimits},
    },
};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

#[tokio::test]
async fn out_of_order_chunks_assemble_in_index_order() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 3).await;

    env.send(&id, 1, 3, b"B1-").await;
    env.send(&id, 0, 3, b"B0-").await;
    env.send(&id, 2, 3, b"B2").await;

    let expected = sha256_hex(b"B0-B1-B2");
    let done = env.service.complete(&id, Some(expected.clone())).await.unwrap();
    assert!(done.checksum_valid);
    assert_eq!(done.sha256, expected);
    assert_eq!(done.file_size, 8);
    assert!(done.final_path.starts_with("dicom/"));
    assert!(done.final_path.ends_with(".bin"));

    let stored = env.storage.full_path(&done.final_path).unwrap();
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"B0-B1-B2");
    assert!(!env.service.chunk_store().upload_dir(&done.upload_id).exists());

    // a completed session is gone
    assert!(matches!(
        env.service.status(&id),
        Err(UploadError::SessionNotFound(_))
    ));
    assert_eq!(env.storage.store_count(), 1);
}

#[tokio::test]
async fn complete_with_missing_chunk_reports_counts_and_stays_resumable() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 3).await;
    env.send(&id, 0, 3, b"aaa").await;
    env.send(&id, 2, 3, b"ccc").await;

    match env.service.complete(&id, None).await {
        Err(UploadError::IncompleteUpload {
            received,
            total,
            missing,
        }) => {
            assert_eq!((received, total), (2, 3));
            assert_eq!(missing, vec![1]);
        }
        other => panic!("expected IncompleteUpload, got {other:?}"),
    }

    let progress = env.service.status(&id).unwrap();
    assert_eq!(progress.status, UploadStatus::Uploading);
    assert_eq!(progress.chunks_received, 2);

    env.send(&id, 1, 3, b"bbb").await;
    let done = env.service.complete(&id, None).await.unwrap();
    assert_eq!(done.file_size, 9);
}

#[tokio::test]
async fn resending_a_chunk_overwrites_without_double_counting() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 2).await;

    env.send(&id, 0, 2, b"old").await;
    env.send(&id, 0, 2, b"new").await;
    let progress = env.service.status(&id).unwrap();
    assert_eq!(progress.chunks_received, 1);
    assert_eq!(progress.progress, 50.0);

    env.send(&id, 1, 2, b"!").await;
    let done = env.service.complete(&id, None).await.unwrap();
    let stored = env.storage.full_path(&done.final_path).unwrap();
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"new!");
}

#[tokio::test]
async fn checksum_mismatch_never_reaches_storage_and_can_be_retried() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 2).await;
    env.send(&id, 0, 2, b"ab").await;
    env.send(&id, 1, 2, b"cd").await;

    let wrong = "0".repeat(64);
    match env.service.complete(&id, Some(wrong.clone())).await {
        Err(UploadError::ChecksumMismatch {
            chunk_index,
            expected,
            actual,
        }) => {
            assert_eq!(chunk_index, None);
            assert_eq!(expected, wrong);
            assert_eq!(actual, sha256_hex(b"abcd"));
        }
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
    assert_eq!(env.storage.store_count(), 0);
    assert_eq!(env.service.status(&id).unwrap().status, UploadStatus::Error);

    let upper = sha256_hex(b"abcd").to_uppercase();
    let done = env.service.complete(&id, Some(upper)).await.unwrap();
    assert!(done.checksum_valid);
    assert_eq!(env.storage.store_count(), 1);
}

#[tokio::test]
async fn checksum_given_at_init_is_enforced() {
    let env = TestEnv::new().await;
    let progress = env
        .service
        .init(InitUpload {
            filename: "ct.dcm".into(),
            file_size: 4,
            total_chunks: 1,
            chunk_size: 4,
            sha256: Some(sha256_hex(b"nope")),
        })
        .await
        .unwrap();
    let id = progress.upload_id.to_string();
    env.send(&id, 0, 1, b"data").await;

    let err = env.service.complete(&id, None).await.unwrap_err();
    assert!(matches!(err, UploadError::ChecksumMismatch { .. }));

    // a per-call checksum takes precedence over the one from init
    let done = env
        .service
        .complete(&id, Some(sha256_hex(b"data")))
        .await
        .unwrap();
    assert!(done.final_path.ends_with(".dcm"));
}

#[tokio::test]
async fn chunk_checksum_is_verified_before_recording() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 2).await;

    let bad = ChunkMeta {
        sha256: Some(sha256_hex(b"other")),
        ..meta(1, 2)
    };
    match env.service.upload_chunk(&id, bad, body(b"payload")).await {
        Err(UploadError::ChecksumMismatch { chunk_index, .. }) => {
            assert_eq!(chunk_index, Some(1))
        }
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
    assert_eq!(env.service.status(&id).unwrap().chunks_received, 0);

    let good = ChunkMeta {
        sha256: Some(sha256_hex(b"payload")),
        ..meta(1, 2)
    };
    env.service
        .upload_chunk(&id, good, body(b"payload"))
        .await
        .unwrap();
    assert_eq!(env.service.status(&id).unwrap().chunks_received, 1);
}

#[tokio::test]
async fn chunk_requests_are_validated() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 2).await;

    let out_of_range = env.service.upload_chunk(&id, meta(2, 2), body(b"x")).await;
    assert!(matches!(out_of_range, Err(UploadError::InvalidRequest(_))));

    let wrong_total = env.service.upload_chunk(&id, meta(0, 3), body(b"x")).await;
    assert!(matches!(wrong_total, Err(UploadError::InvalidRequest(_))));

    let unknown = Uuid::new_v4().to_string();
    let missing = env.service.upload_chunk(&unknown, meta(0, 2), body(b"x")).await;
    assert!(matches!(missing, Err(UploadError::SessionNotFound(_))));

    let malformed = env.service.upload_chunk("../etc", meta(0, 2), body(b"x")).await;
    assert!(matches!(malformed, Err(UploadError::SessionNotFound(_))));
}

#[tokio::test]
async fn init_rejects_bad_input() {
    let env = TestEnv::with_limits(UploadLimits {
        max_file_size: 1024,
        ..UploadLimits::default()
    })
    .await;
    let base = InitUpload {
        filename: "scan.bin".into(),
        file_size: 10,
        total_chunks: 1,
        chunk_size: 10,
        sha256: None,
    };

    let cases = [
        InitUpload {
            filename: "   ".into(),
            ..base.clone()
        },
        InitUpload {
            total_chunks: 0,
            ..base.clone()
        },
        InitUpload {
            file_size: 4096,
            ..base.clone()
        },
        InitUpload {
            sha256: Some("not-hex".into()),
            ..base.clone()
        },
    ];
    for case in cases {
        let err = env.service.init(case).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)), "{err:?}");
    }
    assert!(env.service.registry().is_empty());

    let ok = env.service.init(base).await.unwrap();
    assert_eq!(ok.status, UploadStatus::Initialized);
    assert_eq!(ok.progress, 0.0);
}

#[tokio::test]
async fn cancel_is_idempotent_and_removes_chunks() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 2).await;
    env.send(&id, 0, 2, b"abc").await;
    let uuid = Uuid::parse_str(&id).unwrap();
    assert!(env.service.chunk_store().upload_dir(&uuid).exists());

    env.service.cancel(&id).await;
    env.service.cancel(&id).await;
    env.service.cancel("not-a-uuid").await;

    assert!(!env.service.chunk_store().upload_dir(&uuid).exists());
    assert!(matches!(
        env.service.status(&id),
        Err(UploadError::SessionNotFound(_))
    ));
    let late = env.service.upload_chunk(&id, meta(1, 2), body(b"x")).await;
    assert!(matches!(late, Err(UploadError::SessionNotFound(_))));
}

#[tokio::test]
async fn concurrent_complete_is_rejected_while_one_is_in_flight() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 1).await;
    env.send(&id, 0, 1, b"only").await;
    env.storage.hold_stores();

    let first = {
        let service = env.service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.complete(&id, None).await })
    };
    env.storage.entered.notified().await;

    let second = env.service.complete(&id, None).await;
    assert!(
        matches!(second, Err(UploadError::ConflictingOperation(_))),
        "{second:?}"
    );
    let chunk = env.service.upload_chunk(&id, meta(0, 1), body(b"late")).await;
    assert!(matches!(chunk, Err(UploadError::ConflictingOperation(_))));

    env.storage.release.notify_one();
    let done = first.await.unwrap().unwrap();
    assert_eq!(done.file_size, 4);
    assert_eq!(env.storage.store_count(), 1);
}

#[tokio::test]
async fn cancel_during_completion_discards_the_stored_file() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 1).await;
    env.send(&id, 0, 1, b"bytes").await;
    env.storage.hold_stores();

    let completing = {
        let service = env.service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.complete(&id, None).await })
    };
    env.storage.entered.notified().await;

    env.service.cancel(&id).await;
    env.storage.release.notify_one();

    let result = completing.await.unwrap();
    assert!(matches!(result, Err(UploadError::SessionNotFound(_))));
    assert_eq!(env.storage.delete_count(), 1);

    let uuid = Uuid::parse_str(&id).unwrap();
    assert!(!env.service.chunk_store().upload_dir(&uuid).exists());
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stored_files")
        .fetch_one(&*env.db)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn parallel_chunk_uploads_are_all_counted() {
    let env = TestEnv::new().await;
    let total = 16u32;
    let id = env.init("scan.bin", total).await;

    let mut tasks = Vec::new();
    for index in (0..total).rev() {
        let service = env.service.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let data = vec![index as u8; 32];
            service
                .upload_chunk(&id, meta(index, total), body(&data))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(env.service.status(&id).unwrap().chunks_received, total);
    let done = env.service.complete(&id, None).await.unwrap();
    let stored = tokio::fs::read(env.storage.full_path(&done.final_path).unwrap())
        .await
        .unwrap();
    let expected: Vec<u8> = (0..total).flat_map(|i| vec![i as u8; 32]).collect();
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn sweep_expires_idle_sessions_and_orphaned_directories() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 2).await;
    env.send(&id, 0, 2, b"abc").await;

    let orphan = Uuid::new_v4();
    env.service
        .chunk_store()
        .create_upload_dir(&orphan)
        .await
        .unwrap();

    // nothing is older than a day
    let report = env.service.sweep_idle(Duration::from_secs(86_400)).await.unwrap();
    assert_eq!(report.expired_sessions, 0);
    assert_eq!(report.orphan_dirs, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = env.service.sweep_idle(Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.expired_sessions, 1);
    assert_eq!(report.orphan_dirs, 1);

    assert!(env.service.registry().is_empty());
    assert!(!env.service.chunk_store().upload_dir(&orphan).exists());
    assert!(matches!(
        env.service.status(&id),
        Err(UploadError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn complete_is_refused_while_a_chunk_overwrite_is_in_flight() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 1).await;
    env.send(&id, 0, 1, b"old").await;

    let gate = Arc::new(Gate::default());
    let overwrite = {
        let service = env.service.clone();
        let id = id.clone();
        let content = gated_body(b"new", gate.clone());
        tokio::spawn(async move { service.upload_chunk(&id, meta(0, 1), content).await })
    };
    gate.entered.notified().await;

    let blocked = env.service.complete(&id, None).await;
    assert!(
        matches!(blocked, Err(UploadError::ConflictingOperation(_))),
        "{blocked:?}"
    );
    assert_eq!(env.storage.store_count(), 0);

    gate.release.notify_one();
    overwrite.await.unwrap().unwrap();

    // a failed store keeps the session and its chunks for a retry
    env.storage.fail_next_store();
    let failed = env.service.complete(&id, None).await;
    assert!(matches!(failed, Err(UploadError::StorageIo(_))), "{failed:?}");
    assert_eq!(env.service.status(&id).unwrap().status, UploadStatus::Uploading);

    let done = env.service.complete(&id, None).await.unwrap();
    let stored = env.storage.full_path(&done.final_path).unwrap();
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"new");
}

#[tokio::test]
async fn abandoned_chunk_upload_does_not_block_completion() {
    let env = TestEnv::new().await;
    let id = env.init("scan.bin", 1).await;
    env.send(&id, 0, 1, b"kept").await;

    let gate = Arc::new(Gate::default());
    let upload = {
        let service = env.service.clone();
        let id = id.clone();
        let content = gated_body(b"lost", gate.clone());
        tokio::spawn(async move { service.upload_chunk(&id, meta(0, 1), content).await })
    };
    gate.entered.notified().await;
    upload.abort();
    assert!(upload.await.unwrap_err().is_cancelled());

    let done = env.service.complete(&id, None).await.unwrap();
    let stored = env.storage.full_path(&done.final_path).unwrap();
    assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"kept");
}

#[tokio::test]
async fn cancel_during_assembly_skips_storage() {
    let env = TestEnv::new().await;
    let total = 8;
    let id = env.init("scan.bin", total).await;
    for index in 0..total {
        env.send(&id, index, total, &[index as u8; 64]).await;
    }
    let uuid = Uuid::parse_str(&id).unwrap();
    let handle = env.service.registry().get(&uuid).unwrap();

    let completing = {
        let service = env.service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.complete(&id, None).await })
    };
    // single-threaded runtime: the task parks on its first file operation
    while !lock_session(&handle).is_completing() {
        tokio::task::yield_now().await;
    }
    env.service.cancel(&id).await;

    let result = completing.await.unwrap();
    assert!(matches!(result, Err(UploadError::SessionNotFound(_))), "{result:?}");
    assert_eq!(env.storage.store_count(), 0);
    assert_eq!(lock_session(&handle).status(), UploadStatus::Cancelled);
    assert!(!lock_session(&handle).is_completing());
    assert!(!env.service.chunk_store().upload_dir(&uuid).exists());
}
