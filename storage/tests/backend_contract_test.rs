//! Behaviour every backend must share, run once per backend.
//!
//! Each check goes through `StorageFacade` without an embedding service, so
//! only plain persistence is exercised here. Vector behaviour lives in
//! facade_test.rs and backfill_test.rs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chat_storage::{
    RetentionConfig, RetentionManager, RetentionOutcome, SettingsDefaults, SettingsPatch,
    StorageBackend, StorageConfig, UserProfile,
};
use chrono::Duration as ChronoDuration;
use tempfile::TempDir;

use common::{at_hours, at_minutes, facade, ids, msg};

async fn check_chronology(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    // Inserted out of order on purpose.
    for (id, minute) in [(3, 30), (1, 10), (5, 50), (2, 20), (4, 40)] {
        store
            .add_message(&msg(1, id, minute, &format!("message {}", id)))
            .await
            .expect("add failed");
    }

    let recent = store.get_recent(1, 3).await.expect("get_recent failed");
    assert_eq!(ids(&recent), vec![3, 4, 5]);

    let all = store.get_recent(1, 100).await.expect("get_recent failed");
    assert_eq!(ids(&all), vec![1, 2, 3, 4, 5]);
    assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    assert!(store.get_recent(1, 0).await.unwrap().is_empty());
    assert!(store.get_recent(2, 10).await.unwrap().is_empty());
}

async fn check_idempotent_ingest(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    store.add_message(&msg(1, 7, 0, "first")).await.unwrap();
    store
        .add_message(&msg(1, 7, 0, "edited").with_reply_to(3))
        .await
        .unwrap();

    let all = store.get_recent(1, 10).await.unwrap();
    assert_eq!(all.len(), 1);
    let stored = store.get_message(1, 7).await.unwrap().expect("message missing");
    assert_eq!(stored.text, "edited");
    assert_eq!(stored.reply_to_message_id, 3);
    assert!(store.get_message(1, 8).await.unwrap().is_none());
}

async fn check_rejects_non_positive_id(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    let err = store.add_message(&msg(1, 0, 0, "x")).await.unwrap_err();
    assert!(matches!(err, chat_storage::StorageError::Validation(_)));
}

async fn check_get_since(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    for id in 1..=6 {
        let mut m = msg(1, id, id * 10, "hello");
        m.user_id = if id % 2 == 0 { 200 } else { 100 };
        store.add_message(&m).await.unwrap();
    }

    let since = store.get_since(1, None, at_minutes(30), 100).await.unwrap();
    assert_eq!(ids(&since), vec![3, 4, 5, 6]);

    let by_user = store.get_since(1, Some(200), at_minutes(0), 100).await.unwrap();
    assert_eq!(ids(&by_user), vec![2, 4, 6]);

    // Newest `limit` are kept, still oldest first.
    let limited = store.get_since(1, None, at_minutes(0), 2).await.unwrap();
    assert_eq!(ids(&limited), vec![5, 6]);
}

async fn check_reply_chain(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    store.add_message(&msg(1, 1, 0, "root")).await.unwrap();
    store.add_message(&msg(1, 2, 1, "a").with_reply_to(1)).await.unwrap();
    store.add_message(&msg(1, 3, 2, "b").with_reply_to(2)).await.unwrap();
    // Replies to a message that was never stored.
    store.add_message(&msg(1, 5, 3, "orphan").with_reply_to(4)).await.unwrap();

    let chain = store.get_reply_chain(1, 3, 10).await.unwrap();
    assert_eq!(ids(&chain), vec![1, 2, 3]);

    let shallow = store.get_reply_chain(1, 3, 2).await.unwrap();
    assert_eq!(ids(&shallow), vec![2, 3]);

    let truncated = store.get_reply_chain(1, 5, 10).await.unwrap();
    assert_eq!(ids(&truncated), vec![5]);

    assert!(store.get_reply_chain(1, 99, 10).await.unwrap().is_empty());
    assert!(store.get_reply_chain(1, 3, 0).await.unwrap().is_empty());
}

async fn check_reply_cycle_terminates(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    store.add_message(&msg(1, 1, 0, "a").with_reply_to(2)).await.unwrap();
    store.add_message(&msg(1, 2, 1, "b").with_reply_to(1)).await.unwrap();

    let chain = store.get_reply_chain(1, 2, 50).await.unwrap();
    assert_eq!(ids(&chain), vec![1, 2]);
}

async fn check_clear_and_list(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    store.add_message(&msg(30, 1, 0, "x")).await.unwrap();
    store.add_message(&msg(10, 1, 0, "y")).await.unwrap();
    store.add_message(&msg(10, 2, 1, "z")).await.unwrap();
    store.record_activity(10, 100, "alice", at_minutes(1)).await.unwrap();

    assert_eq!(store.list_chat_ids().await.unwrap(), vec![10, 30]);

    assert_eq!(store.clear_chat(10).await.unwrap(), 2);
    assert!(store.get_recent(10, 10).await.unwrap().is_empty());
    assert_eq!(store.list_chat_ids().await.unwrap(), vec![30]);
    assert_eq!(store.clear_chat(10).await.unwrap(), 0);

    // Profiles survive a chat clear.
    assert!(store.get_profile(10, 100).await.unwrap().is_some());
}

async fn check_profiles(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    assert!(store.get_profile(1, 100).await.unwrap().is_none());

    let mut profile = UserProfile::new(1, 100).with_username("alice");
    profile.real_name = "Alice".to_string();
    let first = store.upsert_profile(&profile).await.unwrap();

    profile.freeform_bio = "likes tea".to_string();
    profile.created_at = first.created_at + ChronoDuration::days(1);
    let second = store.upsert_profile(&profile).await.unwrap();
    assert!(second.updated_at > first.updated_at);
    assert_eq!(second.created_at, first.created_at);

    let stored = store.get_profile(1, 100).await.unwrap().expect("profile missing");
    assert_eq!(stored.freeform_bio, "likes tea");
    assert_eq!(stored.real_name, "Alice");
    assert_eq!(stored.created_at, first.created_at);
    assert_eq!(stored.updated_at, second.updated_at);
}

async fn check_profile_listing(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    store.record_activity(1, 100, "old", at_hours(1)).await.unwrap();
    store.record_activity(1, 200, "new", at_hours(5)).await.unwrap();
    store.upsert_profile(&UserProfile::new(1, 300)).await.unwrap();
    store.record_activity(2, 400, "other", at_hours(9)).await.unwrap();

    let listed: Vec<i64> = store
        .list_profiles(1)
        .await
        .unwrap()
        .iter()
        .map(|p| p.user_id)
        .collect();
    assert_eq!(listed, vec![200, 100, 300]);

    // An older sighting never moves last_seen backwards; an empty username keeps the old one.
    let p = store.record_activity(1, 200, "", at_hours(2)).await.unwrap();
    assert_eq!(p.last_seen, Some(at_hours(5)));
    assert_eq!(p.username, "new");
}

async fn check_settings_defaults(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());
    let defaults = SettingsDefaults::default();

    assert!(store.settings().get_stored(5).await.unwrap().is_none());
    let resolved = store.get_settings(5).await.unwrap();
    assert_eq!(resolved.conversation_style, defaults.conversation_style);
    assert_eq!(resolved.temperature, defaults.temperature);
    assert_eq!(resolved.model, defaults.model);
    assert_eq!(resolved.safety_threshold, defaults.safety_threshold);
    assert_eq!(resolved.direct_reply_limit, defaults.direct_reply_limit);

    // Materialized synchronously by the read.
    let stored = store.settings().get_stored(5).await.unwrap().expect("not materialized");
    assert!(stored.is_complete());
}

async fn check_settings_patch(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend, None, &StorageConfig::default());

    // A patch may be the first write for a chat.
    let resolved = store
        .patch_settings(6, SettingsPatch::Temperature(0.3))
        .await
        .unwrap();
    assert_eq!(resolved.temperature, 0.3);
    assert_eq!(resolved.model, SettingsDefaults::default().model);

    let stored = store.settings().get_stored(6).await.unwrap().unwrap();
    assert_eq!(stored.temperature, Some(0.3));
    assert!(stored.model.is_none());

    store.settings().set(6, "model", "gpt-4o").await.unwrap();
    let resolved = store.get_settings(6).await.unwrap();
    assert_eq!(resolved.temperature, 0.3);
    assert_eq!(resolved.model, "gpt-4o");

    // Reading filled the gaps without overwriting patched fields.
    let stored = store.settings().get_stored(6).await.unwrap().unwrap();
    assert!(stored.is_complete());
    assert_eq!(stored.temperature, Some(0.3));
    assert_eq!(stored.model.as_deref(), Some("gpt-4o"));
}

async fn check_footprint_and_retention(backend: Arc<dyn StorageBackend>) {
    let store = facade(backend.clone(), None, &StorageConfig::default());
    for id in 1..=5 {
        store
            .add_message(&chat_storage::Message::new(1, id, 100, at_hours(id - 1), "héllo"))
            .await
            .unwrap();
    }

    let state = store.chat_state(1).await.unwrap();
    // "héllo" is 6 bytes of UTF-8.
    assert_eq!(state.size_bytes, 5 * (64 + 6));
    assert_eq!(state.oldest, Some(at_hours(0)));

    // Exactly at the limit: untouched.
    let at_limit = RetentionManager::new(
        backend.clone(),
        RetentionConfig {
            max_size_bytes: state.size_bytes,
            check_interval: Duration::from_secs(60),
            chunk: Duration::from_secs(2 * 3600),
        },
        Duration::from_secs(5),
    );
    assert_eq!(
        at_limit.evaluate_chat(1).await.unwrap(),
        RetentionOutcome::UnderLimit { size_bytes: state.size_bytes }
    );

    let over_limit = RetentionManager::new(
        backend,
        RetentionConfig {
            max_size_bytes: state.size_bytes - 1,
            check_interval: Duration::from_secs(60),
            chunk: Duration::from_secs(2 * 3600),
        },
        Duration::from_secs(5),
    );
    let outcome = over_limit.evaluate_chat(1).await.unwrap();
    assert_eq!(
        outcome,
        RetentionOutcome::Trimmed {
            size_before: state.size_bytes,
            deleted: 2,
            boundary: at_hours(2),
        }
    );
    assert_eq!(ids(&store.get_recent(1, 10).await.unwrap()), vec![3, 4, 5]);
    assert_eq!(store.chat_state(1).await.unwrap().oldest, Some(at_hours(2)));

    let empty = store.chat_state(99).await.unwrap();
    assert_eq!(empty.size_bytes, 0);
    assert_eq!(empty.oldest, None);
}

macro_rules! backend_contract {
    ($backend:ident, $open:path) => {
        mod $backend {
            use super::*;

            async fn open() -> (TempDir, Arc<dyn StorageBackend>) {
                $open().await
            }

            #[tokio::test]
            async fn test_chronology() {
                let (_dir, backend) = open().await;
                check_chronology(backend).await;
            }

            #[tokio::test]
            async fn test_idempotent_ingest() {
                let (_dir, backend) = open().await;
                check_idempotent_ingest(backend).await;
            }

            #[tokio::test]
            async fn test_rejects_non_positive_id() {
                let (_dir, backend) = open().await;
                check_rejects_non_positive_id(backend).await;
            }

            #[tokio::test]
            async fn test_get_since() {
                let (_dir, backend) = open().await;
                check_get_since(backend).await;
            }

            #[tokio::test]
            async fn test_reply_chain() {
                let (_dir, backend) = open().await;
                check_reply_chain(backend).await;
            }

            #[tokio::test]
            async fn test_reply_cycle_terminates() {
                let (_dir, backend) = open().await;
                check_reply_cycle_terminates(backend).await;
            }

            #[tokio::test]
            async fn test_clear_and_list() {
                let (_dir, backend) = open().await;
                check_clear_and_list(backend).await;
            }

            #[tokio::test]
            async fn test_profiles() {
                let (_dir, backend) = open().await;
                check_profiles(backend).await;
            }

            #[tokio::test]
            async fn test_profile_listing() {
                let (_dir, backend) = open().await;
                check_profile_listing(backend).await;
            }

            #[tokio::test]
            async fn test_settings_defaults() {
                let (_dir, backend) = open().await;
                check_settings_defaults(backend).await;
            }

            #[tokio::test]
            async fn test_settings_patch() {
                let (_dir, backend) = open().await;
                check_settings_patch(backend).await;
            }

            #[tokio::test]
            async fn test_footprint_and_retention() {
                let (_dir, backend) = open().await;
                check_footprint_and_retention(backend).await;
            }
        }
    };
}

backend_contract!(sqlite, common::sqlite_backend);
backend_contract!(file, common::file_backend);
