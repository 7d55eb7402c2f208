#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for log streaming through the lifecycle manager.
//!
//! Verifies that every way a subscription can end releases the engine-side
//! stream.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use gamectl_daemon::engine::{ContainerRef, EngineError, MemoryEngine};
use gamectl_daemon::lifecycle::{LifecycleError, LifecycleManager, ManagerOptions, NewServer};
use gamectl_daemon::logs::{LogEvent, LogSubscription};
use gamectl_daemon::storage::{Database, GameSettings, ServerRecord, ServerStatus};

const WAIT: Duration = Duration::from_secs(2);

async fn setup() -> (LifecycleManager, Arc<MemoryEngine>, Database, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().await.unwrap();
    let engine = Arc::new(MemoryEngine::new());
    let manager = LifecycleManager::new(
        db.clone(),
        tmp.path(),
        engine.clone(),
        ManagerOptions::default(),
    );
    (manager, engine, db, tmp)
}

async fn running_server(manager: &LifecycleManager, db: &Database) -> (String, ContainerRef) {
    let created = manager
        .create_server(NewServer::new("Logs", "p", 4))
        .await
        .unwrap();
    manager.wait_for_launches().await;
    let record = db.get_server(&created.id).await.unwrap().unwrap();
    (created.id, record.container_ref.unwrap())
}

async fn next_event(logs: &mut LogSubscription) -> Option<LogEvent> {
    tokio::time::timeout(WAIT, logs.recv()).await.unwrap()
}

async fn next_message(logs: &mut LogSubscription) -> String {
    match next_event(logs).await {
        Some(LogEvent::Line(line)) => line.message,
        other => panic!("expected a log line, got {other:?}"),
    }
}

/// Poll until the engine reports no open log streams.
async fn wait_for_streams_closed(engine: &MemoryEngine) {
    tokio::time::timeout(WAIT, async {
        while engine.open_log_streams() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// =========================================================================
// Delivery
// =========================================================================

#[tokio::test]
async fn lines_arrive_in_order_with_history_first() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, container) = running_server(&manager, &db).await;
    engine.push_log(&container, "booting\n");

    let mut logs = manager.stream_logs(&id).await.unwrap();
    assert_eq!(next_message(&mut logs).await, "booting");

    engine.push_log(&container, "world loaded\r\n\n  player joined  \n");
    assert_eq!(next_message(&mut logs).await, "world loaded");
    assert_eq!(next_message(&mut logs).await, "player joined");

    logs.close().await;
    assert_eq!(engine.open_log_streams(), 0);
}

#[tokio::test]
async fn container_stop_ends_stream() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, container) = running_server(&manager, &db).await;

    let mut logs = manager.stream_logs(&id).await.unwrap();
    engine.push_log(&container, "shutting down");
    assert_eq!(next_message(&mut logs).await, "shutting down");

    manager.stop_server(&id).await.unwrap();
    assert!(next_event(&mut logs).await.is_none());
    wait_for_streams_closed(&engine).await;
}

#[tokio::test]
async fn engine_failure_is_terminal_error_event() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, container) = running_server(&manager, &db).await;

    let mut logs = manager.stream_logs(&id).await.unwrap();
    // Wait for the relay to be subscribed before breaking the stream.
    engine.push_log(&container, "ready");
    assert_eq!(next_message(&mut logs).await, "ready");

    engine.break_logs(&container, EngineError::Api("log driver crashed".into()));
    match next_event(&mut logs).await {
        Some(LogEvent::Error { message }) => assert!(message.contains("log driver crashed")),
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(next_event(&mut logs).await.is_none());
    wait_for_streams_closed(&engine).await;
}

// =========================================================================
// Disconnects
// =========================================================================

#[tokio::test]
async fn dropping_subscription_mid_stream_releases_engine_stream() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, container) = running_server(&manager, &db).await;

    let mut logs = manager.stream_logs(&id).await.unwrap();
    for i in 0..10 {
        engine.push_log(&container, &format!("line {i}"));
    }
    assert_eq!(next_message(&mut logs).await, "line 0");
    assert_eq!(engine.open_log_streams(), 1);

    drop(logs);
    wait_for_streams_closed(&engine).await;
}

#[tokio::test]
async fn unread_subscription_is_released_on_drop() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, container) = running_server(&manager, &db).await;

    // Fill the channel so the producer is parked on a full send.
    let logs = manager.stream_logs(&id).await.unwrap();
    for i in 0..(manager.options().log_buffer + 50) {
        engine.push_log(&container, &format!("line {i}"));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(logs);
    wait_for_streams_closed(&engine).await;
}

#[tokio::test]
async fn repeated_connect_disconnect_does_not_leak() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, container) = running_server(&manager, &db).await;

    for i in 0..50 {
        let mut logs = manager.stream_logs(&id).await.unwrap();
        engine.push_log(&container, &format!("cycle {i}"));
        // History replays earlier cycles; just make sure something arrives.
        assert!(matches!(next_event(&mut logs).await, Some(LogEvent::Line(_))));
        if i % 2 == 0 {
            logs.close().await;
        } else {
            drop(logs);
        }
    }
    wait_for_streams_closed(&engine).await;
}

// =========================================================================
// Attach failures
// =========================================================================

#[tokio::test]
async fn attach_fails_fast_for_unknown_or_containerless_servers() {
    let (manager, engine, db, _tmp) = setup().await;

    assert!(matches!(
        manager.stream_logs("nope").await,
        Err(LifecycleError::NotFound(_))
    ));

    let now = chrono::Utc::now();
    db.insert_server(&ServerRecord {
        id: "bare".into(),
        settings: GameSettings {
            name: "Bare".into(),
            password: String::new(),
            max_players: 4,
            description: String::new(),
            exp_rate: 1.0,
            capture_rate: 1.0,
            spawn_rate: 1.0,
        },
        admin_secret: "secret".into(),
        port: 8300,
        container_ref: None,
        status: ServerStatus::Error,
        last_error: Some("image pull failed".into()),
        created_at: now,
        updated_at: now,
    })
    .await
    .unwrap();
    assert!(matches!(
        manager.stream_logs("bare").await,
        Err(LifecycleError::NoContainer(_))
    ));

    assert_eq!(engine.open_log_streams(), 0);
}

#[tokio::test]
async fn attach_fails_when_engine_unreachable() {
    let (manager, engine, db, _tmp) = setup().await;
    let (id, _) = running_server(&manager, &db).await;
    engine.set_available(false);

    assert!(matches!(
        manager.stream_logs(&id).await,
        Err(LifecycleError::EngineUnavailable(_))
    ));
    assert_eq!(engine.open_log_streams(), 0);
}
