//! RetentionManager integration tests: cycles over many chats, failure
//! isolation and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chat_storage::{
    CycleReport, Message, RetentionConfig, RetentionManager, StorageBackend, StorageConfig,
};
use tokio_util::sync::CancellationToken;

use common::{at_hours, facade, file_backend, ids, sqlite_backend, FlakyBackend};

fn config(max_size_bytes: u64) -> RetentionConfig {
    RetentionConfig {
        max_size_bytes,
        check_interval: Duration::from_secs(3600),
        chunk: Duration::from_secs(2 * 3600),
    }
}

/// Five messages one hour apart, ids 1..=5, starting at t0.
async fn seed_chat(backend: &Arc<dyn StorageBackend>, chat_id: i64) {
    let store = facade(backend.clone(), None, &StorageConfig::default());
    for id in 1..=5 {
        store
            .add_message(&Message::new(chat_id, id, 100, at_hours(id - 1), "0123456789"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_cycle_trims_only_chats_over_limit() {
    let (_dir, backend) = sqlite_backend().await;
    seed_chat(&backend, 1).await;
    let store = facade(backend.clone(), None, &StorageConfig::default());
    store
        .add_message(&Message::new(2, 1, 100, at_hours(0), "tiny"))
        .await
        .unwrap();

    // Chat 1 is 5 * 74 bytes, chat 2 is 68 bytes.
    let manager = RetentionManager::new(backend.clone(), config(100), Duration::from_secs(5));
    let report = manager.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        report,
        CycleReport {
            chats_checked: 2,
            chats_trimmed: 1,
            messages_deleted: 2,
            failures: 0,
            cancelled: false,
        }
    );
    assert_eq!(ids(&store.get_recent(1, 10).await.unwrap()), vec![3, 4, 5]);
    assert_eq!(store.get_recent(2, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_one_chunk_per_cycle() {
    let (_dir, backend) = file_backend().await;
    seed_chat(&backend, 1).await;
    let store = facade(backend.clone(), None, &StorageConfig::default());
    let manager = RetentionManager::new(backend, config(0), Duration::from_secs(5));

    manager.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(ids(&store.get_recent(1, 10).await.unwrap()), vec![3, 4, 5]);

    manager.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(ids(&store.get_recent(1, 10).await.unwrap()), vec![5]);
}

#[tokio::test]
async fn test_failing_chat_does_not_block_others() {
    let (_dir, inner) = file_backend().await;
    seed_chat(&inner, 1).await;
    seed_chat(&inner, 2).await;

    let backend: Arc<dyn StorageBackend> = Arc::new(FlakyBackend::new(inner.clone(), [1]));
    let manager = RetentionManager::new(backend, config(100), Duration::from_secs(5));
    let report = manager.run_cycle(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.chats_checked, 2);
    assert_eq!(report.failures, 1);
    assert_eq!(report.chats_trimmed, 1);

    let store = facade(inner, None, &StorageConfig::default());
    assert_eq!(store.get_recent(1, 10).await.unwrap().len(), 5);
    assert_eq!(ids(&store.get_recent(2, 10).await.unwrap()), vec![3, 4, 5]);
}

#[tokio::test]
async fn test_cancelled_cycle_checks_nothing() {
    let (_dir, backend) = file_backend().await;
    seed_chat(&backend, 1).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let manager = RetentionManager::new(backend.clone(), config(0), Duration::from_secs(5));
    let report = manager.run_cycle(&cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.chats_checked, 0);
    assert_eq!(backend.recent_messages(1, 10).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_spawned_manager_stops_on_cancel() {
    let (_dir, backend) = file_backend().await;
    seed_chat(&backend, 1).await;

    let manager = Arc::new(RetentionManager::new(
        backend.clone(),
        config(100),
        Duration::from_secs(5),
    ));
    let cancel = CancellationToken::new();
    let handle = manager.spawn(cancel.clone());

    // The first tick fires immediately.
    for _ in 0..100 {
        if backend.recent_messages(1, 10).await.unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.recent_messages(1, 10).await.unwrap().len(), 3);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("manager did not stop")
        .expect("manager panicked");
}
