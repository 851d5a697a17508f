mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use flashsync_common::session::SessionStore;
use flashsync_hub::FileTransferServer;

#[tokio::test]
async fn test_sized_upload_lands_in_session() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    let server = FileTransferServer::start(&common::test_config(tmp.path()), store.clone())
        .await
        .unwrap();

    common::upload(
        server.local_addr(),
        &json!({"session_id": "s1", "filename": "f.bin", "size": 5, "device_id": "d1"}),
        b"hello",
    )
    .await;

    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("s1").map(|m| m.len() == 1).unwrap_or(false)
        })
        .await
    );
    assert_eq!(std::fs::read(tmp.path().join("s1/f.bin")).unwrap(), b"hello");

    let records = store.read_manifest("s1").unwrap();
    assert_eq!(records[0].filename, "f.bin");
    assert_eq!(records[0].size, 5);
    assert_eq!(records[0].device_id, "d1");
    assert!(records[0].received_at_ns > 0);

    server.stop().await;
}

#[tokio::test]
async fn test_unsized_upload_with_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    let server = FileTransferServer::start(&common::test_config(tmp.path()), store.clone())
        .await
        .unwrap();

    common::upload(server.local_addr(), &json!({}), b"0123456789").await;

    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store
                .read_manifest("unknown_session")
                .map(|m| m.len() == 1)
                .unwrap_or(false)
        })
        .await
    );
    let records = store.read_manifest("unknown_session").unwrap();
    assert_eq!(records[0].filename, "data.bin");
    assert_eq!(records[0].device_id, "unknown_device");
    assert_eq!(records[0].size, 10);

    server.stop().await;
}

#[tokio::test]
async fn test_traversal_stays_inside_session() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    let server = FileTransferServer::start(&common::test_config(tmp.path()), store.clone())
        .await
        .unwrap();

    common::upload(
        server.local_addr(),
        &json!({"session_id": "s2", "filename": "../../escape.txt"}),
        b"x",
    )
    .await;

    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("s2").map(|m| m.len() == 1).unwrap_or(false)
        })
        .await
    );
    assert!(tmp.path().join("s2/escape.txt").exists());
    assert!(!tmp.path().join("escape.txt").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_header_does_not_stop_receiver() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    let mut config = common::test_config(tmp.path());
    config.header_limit_bytes = 64;
    let server = FileTransferServer::start(&config, store.clone()).await.unwrap();

    // No newline within the bound: the connection is dropped.
    let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
    bad.write_all(&[b'a'; 256]).await.unwrap();
    let _ = bad.shutdown().await;

    // Malformed header JSON is isolated as well.
    common::upload(server.local_addr(), &json!("not an object"), b"zzz").await;

    common::upload(
        server.local_addr(),
        &json!({"session_id": "ok", "filename": "f.bin", "size": 3}),
        b"abc",
    )
    .await;

    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("ok").map(|m| m.len() == 1).unwrap_or(false)
        })
        .await
    );
    assert!(!tmp.path().join("unknown_session").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_short_upload_records_actual_size() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    let server = FileTransferServer::start(&common::test_config(tmp.path()), store.clone())
        .await
        .unwrap();

    common::upload(
        server.local_addr(),
        &json!({"session_id": "s3", "filename": "f.bin", "size": 100}),
        b"only ten!!",
    )
    .await;

    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("s3").map(|m| m.len() == 1).unwrap_or(false)
        })
        .await
    );
    assert_eq!(store.read_manifest("s3").unwrap()[0].size, 10);

    server.stop().await;
}

#[tokio::test]
async fn test_upload_named_like_manifest_keeps_records() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    let server = FileTransferServer::start(&common::test_config(tmp.path()), store.clone())
        .await
        .unwrap();
    let addr = server.local_addr();

    for name in ["a.bin", "b.bin"] {
        common::upload(addr, &json!({"session_id": "s1", "filename": name, "size": 1}), b"x").await;
    }
    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("s1").map(|m| m.len() == 2).unwrap_or(false)
        })
        .await
    );

    common::upload(
        addr,
        &json!({"session_id": "s1", "filename": "metadata.json", "size": 4}),
        b"junk",
    )
    .await;
    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("s1").map(|m| m.len() == 3).unwrap_or(false)
        })
        .await
    );

    let mut names: Vec<String> = store
        .read_manifest("s1")
        .unwrap()
        .into_iter()
        .map(|r| r.filename)
        .collect();
    names.sort();
    assert_eq!(names, vec!["_metadata.json", "a.bin", "b.bin"]);
    assert_eq!(std::fs::read(tmp.path().join("s1/_metadata.json")).unwrap(), b"junk");

    server.stop().await;
}

#[tokio::test]
async fn test_manifest_failure_keeps_received_file() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(tmp.path()));
    // A directory where the manifest should be makes every append fail.
    std::fs::create_dir_all(tmp.path().join("s4/metadata.json")).unwrap();
    let server = FileTransferServer::start(&common::test_config(tmp.path()), store.clone())
        .await
        .unwrap();
    let addr = server.local_addr();

    common::upload(
        addr,
        &json!({"session_id": "s4", "filename": "f.bin", "size": 5}),
        b"hello",
    )
    .await;
    let target = tmp.path().join("s4/f.bin");
    assert!(
        common::wait_until(Duration::from_secs(3), || {
            std::fs::read(&target).map(|b| b == b"hello").unwrap_or(false)
        })
        .await
    );
    assert!(store.read_manifest("s4").is_err());

    // The receiver keeps serving.
    common::upload(
        addr,
        &json!({"session_id": "s5", "filename": "g.bin", "size": 2}),
        b"ok",
    )
    .await;
    assert!(
        common::wait_until(Duration::from_secs(3), || {
            store.read_manifest("s5").map(|m| m.len() == 1).unwrap_or(false)
        })
        .await
    );
    assert_eq!(std::fs::read(tmp.path().join("s4/f.bin")).unwrap(), b"hello");

    server.stop().await;
}
