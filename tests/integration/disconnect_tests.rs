//! Integration tests for connection teardown.
//!
//! Validates:
//! - peer disconnect releases every pending caller with `Disconnected`
//! - calls issued after teardown fail immediately
//! - local close behaves the same way and is idempotent

use serde_json::json;

use actr_remote::rpc::{Connection, ConnectionOptions};
use actr_remote::AppError;

use super::test_helpers::{MockPeer, TEST_TIMEOUT};

#[tokio::test]
async fn peer_disconnect_releases_all_pending_calls() {
    const HANGING: usize = 5;

    let peer = MockPeer::new();
    let (conn, handle) = peer.attach("alpha").await;

    let mut tasks = Vec::new();
    for _ in 0..HANGING {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move { conn.evaluate("hang", None, &[]).await }));
    }

    // Give every call time to reach the peer before it goes away.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.disconnect();

    for task in tasks {
        let result = tokio::time::timeout(TEST_TIMEOUT, task)
            .await
            .expect("released in time")
            .expect("join");
        assert!(
            matches!(result, Err(AppError::Disconnected(_))),
            "unexpected: {result:?}"
        );
    }

    tokio::time::timeout(TEST_TIMEOUT, conn.closed())
        .await
        .expect("closed in time");
    assert!(!conn.is_alive());
}

#[tokio::test]
async fn calls_after_disconnect_fail_immediately() {
    let peer = MockPeer::new();
    let (conn, handle) = peer.attach("alpha").await;

    handle.disconnect();
    tokio::time::timeout(TEST_TIMEOUT, conn.closed())
        .await
        .expect("closed in time");

    let result = tokio::time::timeout(TEST_TIMEOUT, conn.evaluate("current-model", None, &[]))
        .await
        .expect("no hang");
    assert!(
        matches!(result, Err(AppError::Disconnected(_))),
        "unexpected: {result:?}"
    );
}

#[tokio::test]
async fn local_close_releases_pending_calls() {
    let peer = MockPeer::new();
    let (conn, _handle) = peer.attach("alpha").await;

    let hanging = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.evaluate("hang", None, &[json!(1)]).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    tokio::time::timeout(TEST_TIMEOUT, conn.close())
        .await
        .expect("closed in time");
    conn.close().await;

    let result = tokio::time::timeout(TEST_TIMEOUT, hanging)
        .await
        .expect("released in time")
        .expect("join");
    assert!(
        matches!(result, Err(AppError::Disconnected(_))),
        "unexpected: {result:?}"
    );
    assert!(!conn.is_alive());
}

/// A stream that ends mid-frame still tears the connection down cleanly.
#[tokio::test]
async fn truncated_stream_marks_connection_dead() {
    use tokio::io::AsyncWriteExt;

    let (client_io, mut peer_io) = tokio::io::duplex(1024);
    let conn = Connection::new(client_io, ConnectionOptions::default());

    peer_io
        .write_all(br#"{"id":1,"result":[tr"#)
        .await
        .expect("write");
    drop(peer_io);

    tokio::time::timeout(TEST_TIMEOUT, conn.closed())
        .await
        .expect("closed in time");
    assert!(!conn.is_alive());
}
