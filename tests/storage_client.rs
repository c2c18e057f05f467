mod common;

use bytes::Bytes;
use common::{Fault, FlakyStore, Op, client_for, local_file};
use object_store::{Attribute, ObjectStore, path::Path as ObjectPath};
use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tender_store::{
    DownloadTarget, ErrorKind, ProgressCallback, StorageError, TransferPlanner, UploadOptions,
    UploadSource, WriteCondition,
};
use tokio_util::sync::CancellationToken;

fn small_parts() -> TransferPlanner {
    TransferPlanner::new(1024, 256, 256, 256, 10, 3).unwrap()
}

async fn put(client: &tender_store::ObjectStorageClient, key: &str, body: &'static [u8]) {
    client
        .put_bytes(
            key,
            Bytes::from_static(body),
            &UploadOptions::default(),
            WriteCondition::Overwrite,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn transient_put_failures_are_retried() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    store.fail_next(Op::Put, 2, Fault::Status(503));

    put(&client, "tender-42/a.pdf", b"%PDF").await;

    assert_eq!(store.calls(Op::Put), 3);
    assert_eq!(client.get_bytes("tender-42/a.pdf").await.unwrap().as_ref(), b"%PDF");
}

#[tokio::test]
async fn persistent_server_errors_exhaust_after_four_attempts() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    store.fail_next(Op::Put, u32::MAX, Fault::Status(500));

    let err = client
        .put_object(
            UploadSource::Bytes(Bytes::from_static(b"x")),
            "a.txt",
            &UploadOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(store.calls(Op::Put), 4);
    assert!(matches!(
        err,
        StorageError::RetriesExhausted { attempts: 4, .. }
    ));
}

#[tokio::test]
async fn permanent_errors_surface_on_the_first_attempt() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    store.fail_next(Op::Put, 1, Fault::Status(403));

    let err = client
        .put_object(
            UploadSource::Bytes(Bytes::from_static(b"x")),
            "a.txt",
            &UploadOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(store.calls(Op::Put), 1);
    assert_eq!(err.kind(), ErrorKind::Permanent);
}

#[tokio::test]
async fn status_like_digits_in_keys_are_not_retried() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    // the rendered failure carries `tender-500/...` and `in 1.503ms`
    store.fail_next(Op::Put, 1, Fault::Status(400));

    let err = client
        .put_object(
            UploadSource::Bytes(Bytes::from_static(b"x")),
            "tender-500/a.pdf",
            &UploadOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(store.calls(Op::Put), 1);
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(err.transient_code(), None);
}

#[tokio::test]
async fn transport_timeouts_are_retried() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    put(&client, "slow.txt", b"late").await;
    store.reset_calls();
    store.fail_next(Op::Get, 2, Fault::Timeout);

    assert_eq!(client.get_bytes("slow.txt").await.unwrap().as_ref(), b"late");
    assert_eq!(store.calls(Op::Get), 3);
}

#[tokio::test]
async fn invalid_keys_never_reach_the_store() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    let err = client
        .put_object(
            UploadSource::Bytes(Bytes::from_static(b"x")),
            "a/../b",
            &UploadOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidKey { .. }));
    assert_eq!(store.calls(Op::Put), 0);
}

#[tokio::test]
async fn file_round_trip_with_progress_and_attributes() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    let dir = tempfile::tempdir().unwrap();
    let body = vec![7u8; 4096];
    let source = local_file(dir.path(), "Leistungsverzeichnis.PDF", &body);

    let options = UploadOptions {
        metadata: HashMap::from([("source".to_string(), "portal".to_string())]),
        content_type: None,
    };
    let uploaded = client
        .put_object(UploadSource::Path(source), "tender-7/lv.pdf", &options)
        .await
        .unwrap();
    assert_eq!(uploaded.content_type, "application/pdf");
    assert_eq!(uploaded.size, 4096);

    let stored = store
        .get(&ObjectPath::from("tender-7/lv.pdf"))
        .await
        .unwrap();
    assert_eq!(
        stored.attributes.get(&Attribute::ContentType).map(|v| v.as_ref()),
        Some("application/pdf")
    );
    assert_eq!(
        stored
            .attributes
            .get(&Attribute::Metadata("source".into()))
            .map(|v| v.as_ref()),
        Some("portal")
    );

    let seen = Arc::new(AtomicU64::new(0));
    let sink = seen.clone();
    let progress: ProgressCallback = Arc::new(move |n: u64| sink.store(n, Ordering::SeqCst));
    let dest = dir.path().join("out/nested/lv.pdf");
    let downloaded = client
        .get_object("tender-7/lv.pdf", DownloadTarget::Path(dest.clone()), Some(progress))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(downloaded.size, 4096);
    assert_eq!(downloaded.md5, uploaded.md5);
    assert_eq!(seen.load(Ordering::SeqCst), 4096);
}

#[tokio::test]
async fn large_objects_move_in_parts() {
    let store = FlakyStore::new();
    let client = client_for(&store).with_planner(small_parts());
    let dir = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let source = local_file(dir.path(), "plans.dwg", &body);

    let uploaded = client
        .put_object(UploadSource::Path(source), "tender-9/plans.dwg", &UploadOptions::default())
        .await
        .unwrap();
    assert!(uploaded.multipart);
    assert_eq!(uploaded.size, 3000);

    let dest = dir.path().join("plans-copy.dwg");
    let downloaded = client
        .get_object("tender-9/plans.dwg", DownloadTarget::Path(dest.clone()), None)
        .await
        .unwrap();
    assert!(downloaded.multipart);
    assert_eq!(downloaded.md5, uploaded.md5);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn failed_completion_aborts_and_retries_the_upload() {
    let store = FlakyStore::new();
    let client = client_for(&store).with_planner(small_parts());
    let body = Bytes::from(vec![7u8; 3000]);
    store.fail_next(Op::Complete, 1, Fault::Status(500));

    let receipt = client
        .put_object(UploadSource::Bytes(body.clone()), "big.bin", &UploadOptions::default())
        .await
        .unwrap();

    assert!(receipt.multipart);
    assert_eq!(store.calls(Op::Complete), 2);
    assert_eq!(store.calls(Op::Abort), 1);
    assert_eq!(client.get_bytes("big.bin").await.unwrap(), body);
}

#[tokio::test]
async fn rejected_part_aborts_the_upload() {
    let store = FlakyStore::new();
    let client = client_for(&store).with_planner(small_parts());
    store.fail_next(Op::Part, 1, Fault::Status(400));

    let err = client
        .put_object(
            UploadSource::Bytes(Bytes::from(vec![7u8; 3000])),
            "big.bin",
            &UploadOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(store.calls(Op::Abort), 1);
    assert_eq!(store.calls(Op::Complete), 0);
    assert!(!client.exists("big.bin").await);
}

#[tokio::test]
async fn streams_of_unknown_length_upload() {
    let store = FlakyStore::new();
    let client = client_for(&store).with_planner(small_parts());

    let short = Cursor::new(b"short stream".to_vec());
    let receipt = client
        .put_object(UploadSource::Reader(Box::new(short)), "s.txt", &UploadOptions::default())
        .await
        .unwrap();
    assert!(!receipt.multipart);
    assert_eq!(receipt.content_type, "text/plain");

    let long = Cursor::new(vec![1u8; 5000]);
    let receipt = client
        .put_object(UploadSource::Reader(Box::new(long)), "l.bin", &UploadOptions::default())
        .await
        .unwrap();
    assert!(receipt.multipart);
    assert_eq!(receipt.size, 5000);
    assert_eq!(client.get_bytes("l.bin").await.unwrap().len(), 5000);
}

#[tokio::test]
async fn missing_key_download_leaves_nothing_behind() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("missing.pdf");

    let err = client
        .get_object("nope/missing.pdf", DownloadTarget::Path(dest.clone()), None)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(!dest.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn failed_download_keeps_the_previous_file() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    put(&client, "report.txt", b"new contents").await;

    let dir = tempfile::tempdir().unwrap();
    let dest = local_file(dir.path(), "report.txt", b"old contents");
    store.fail_next(Op::Get, u32::MAX, Fault::Status(502));

    let err = client
        .get_object("report.txt", DownloadTarget::Path(dest.clone()), None)
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::RetriesExhausted { .. }));
    assert_eq!(std::fs::read(&dest).unwrap(), b"old contents");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn download_into_a_writer() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    put(&client, "notes.txt", b"hello").await;

    let mut sink: Vec<u8> = Vec::new();
    let receipt = client
        .get_object("notes.txt", DownloadTarget::Writer(&mut sink), None)
        .await
        .unwrap();
    assert_eq!(sink, b"hello");
    assert_eq!(receipt.size, 5);
}

#[tokio::test]
async fn listing_uses_plain_string_prefixes() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    for key in ["other.txt", "tender-4/x.pdf", "tender-42/a.pdf", "tender-42/b.pdf"] {
        put(&client, key, b"-").await;
    }

    assert_eq!(
        client.list_objects("tender-4").await.unwrap(),
        vec!["tender-4/x.pdf", "tender-42/a.pdf", "tender-42/b.pdf"]
    );
    assert_eq!(
        client.list_objects("tender-42/").await.unwrap(),
        vec!["tender-42/a.pdf", "tender-42/b.pdf"]
    );
    assert_eq!(client.list_objects("tender-42/a").await.unwrap(), vec!["tender-42/a.pdf"]);
    assert!(client.list_objects("absent").await.unwrap().is_empty());
}

#[tokio::test]
async fn listing_skips_keys_outside_the_prefix() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    for i in 0..300 {
        put(&client, &format!("alpha-{:04}.pdf", i), b"-").await;
        put(&client, &format!("zeta-{:04}.pdf", i), b"-").await;
    }
    put(&client, "tender-42/a.pdf", b"-").await;

    store.reset_calls();
    assert_eq!(client.list_objects("tender-42").await.unwrap(), vec!["tender-42/a.pdf"]);
    assert!(store.listed_entries() <= 2, "{}", store.listed_entries());

    store.reset_calls();
    assert_eq!(client.list_objects("tender-42/").await.unwrap(), vec!["tender-42/a.pdf"]);
    assert_eq!(store.listed_entries(), 1);
}

#[tokio::test]
async fn listing_returns_only_the_first_page() {
    let store = FlakyStore::new();
    let client = client_for(&store).with_list_page_size(2);
    for key in ["p/1", "p/2", "p/3", "p/4", "p/5"] {
        put(&client, key, b"-").await;
    }
    assert_eq!(client.list_objects("p/").await.unwrap(), vec!["p/1", "p/2"]);
}

#[tokio::test]
async fn failed_listing_falls_back_to_an_exact_key() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    put(&client, "tender-42/a.pdf", b"-").await;
    store.fail_next(Op::List, u32::MAX, Fault::Status(503));

    assert_eq!(
        client.list_objects("tender-42/a.pdf").await.unwrap(),
        vec!["tender-42/a.pdf"]
    );
    assert!(client.list_objects("tender-42").await.is_err());
}

#[tokio::test]
async fn exists_collapses_head_failures_to_false() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    put(&client, "here.txt", b"-").await;
    assert!(client.exists("here.txt").await);

    store.fail_next(Op::Get, u32::MAX, Fault::Status(403));
    assert!(!client.exists("here.txt").await);
    assert!(client.head_object("here.txt").await.is_err());
}

#[tokio::test]
async fn concurrent_puts_to_distinct_keys_all_land() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    let uploads = (0..16).map(|i| {
        let client = client.clone();
        async move {
            client
                .put_bytes(
                    &format!("batch/{:02}.txt", i),
                    Bytes::from(format!("doc {}", i)),
                    &UploadOptions::default(),
                    WriteCondition::Overwrite,
                )
                .await
        }
    });
    for result in futures::future::join_all(uploads).await {
        result.unwrap();
    }
    assert_eq!(client.list_objects("batch/").await.unwrap().len(), 16);
}

#[tokio::test]
async fn batch_upload_continues_past_failures() {
    let store = FlakyStore::new();
    let client = client_for(&store);
    let dir = tempfile::tempdir().unwrap();
    let a = local_file(dir.path(), "a.pdf", b"a");
    let missing = dir.path().join("missing.pdf");
    let c = local_file(dir.path(), "c.csv", b"c");

    let report = client
        .put_objects(
            &[a.clone(), missing.clone(), c.clone()],
            &tender_store::BatchUploadOptions {
                key_prefix: Some("tender-1".into()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(report.total(), 3);
    assert_eq!(report.succeeded(), 2);
    assert!(report.outcome(&missing).unwrap().result.is_err());
    assert_eq!(report.uploaded_keys(), vec!["tender-1/a.pdf", "tender-1/c.csv"]);
}

#[tokio::test]
async fn cancelled_handles_do_not_touch_the_store() {
    let store = FlakyStore::new();
    let token = CancellationToken::new();
    let client = client_for(&store).with_cancellation(token.clone());
    token.cancel();

    let err = client
        .put_bytes(
            "never.txt",
            Bytes::from_static(b"-"),
            &UploadOptions::default(),
            WriteCondition::Overwrite,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));
    assert_eq!(store.calls(Op::Put), 0);
}

#[tokio::test]
async fn expired_deadline_stops_retrying() {
    let store = FlakyStore::new();
    let client = client_for(&store)
        .with_retry_policy(tender_store::RetryPolicy::new(10, Duration::from_secs(30)))
        .with_deadline(tokio::time::Instant::now() + Duration::from_millis(50));
    store.fail_next(Op::Put, u32::MAX, Fault::Status(500));

    let err = client
        .put_bytes(
            "slow.txt",
            Bytes::from_static(b"-"),
            &UploadOptions::default(),
            WriteCondition::Overwrite,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DeadlineExceeded));
    assert_eq!(store.calls(Op::Put), 1);
}
