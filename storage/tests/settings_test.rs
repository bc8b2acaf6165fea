//! SettingsStore integration tests: injected defaults, validation of text
//! input and convergence of concurrent first reads.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chat_storage::{
    ChatSettings, DirectReplyLimit, SafetyThreshold, SettingsDefaults, SettingsStore,
    StorageBackend, StorageError,
};

use common::{file_backend, sqlite_backend};

fn custom_defaults() -> SettingsDefaults {
    SettingsDefaults {
        conversation_style: "sarcastic".to_string(),
        temperature: 0.7,
        model: "local-model".to_string(),
        safety_threshold: SafetyThreshold::BlockNone,
        voice_transcription_enabled: false,
        direct_reply_limit: DirectReplyLimit {
            enabled: true,
            count: 5,
            window: Duration::from_secs(120),
        },
        srach_analysis_enabled: true,
    }
}

fn store(backend: Arc<dyn StorageBackend>) -> SettingsStore {
    SettingsStore::new(backend, Arc::new(custom_defaults()), Duration::from_secs(5))
}

async fn check_injected_defaults(backend: Arc<dyn StorageBackend>) {
    let settings = store(backend);
    let resolved = settings.get(42).await.unwrap();
    let defaults = custom_defaults();

    assert_eq!(resolved.chat_id, 42);
    assert_eq!(resolved.conversation_style, "sarcastic");
    assert_eq!(resolved.temperature, defaults.temperature);
    assert_eq!(resolved.safety_threshold, SafetyThreshold::BlockNone);
    assert!(!resolved.voice_transcription_enabled);
    assert_eq!(resolved.direct_reply_limit, defaults.direct_reply_limit);
    assert!(resolved.srach_analysis_enabled);
}

async fn check_text_validation(backend: Arc<dyn StorageBackend>) {
    let settings = store(backend);

    for (field, value) in [
        ("no_such_field", "1"),
        ("temperature", "hot"),
        ("temperature", "3.5"),
        ("direct_reply_limit_count", "-1"),
        ("direct_reply_limit_window_secs", "0"),
        ("voice_transcription_enabled", "maybe"),
        ("safety_threshold", "extreme"),
        ("model", ""),
    ] {
        let err = settings.set(7, field, value).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Validation(_)),
            "{field}={value:?} gave {err}"
        );
    }
    // Rejected input never creates a record.
    assert!(settings.get_stored(7).await.unwrap().is_none());

    let resolved = settings.set(7, "safety_threshold", "medium").await.unwrap();
    assert_eq!(resolved.safety_threshold, SafetyThreshold::BlockMediumAndAbove);
    let resolved = settings.set(7, "voice_transcription_enabled", "on").await.unwrap();
    assert!(resolved.voice_transcription_enabled);
    let resolved = settings.set(7, "direct_reply_limit_count", "0").await.unwrap();
    assert_eq!(resolved.direct_reply_limit.count, 0);
}

async fn check_whole_record_upsert(backend: Arc<dyn StorageBackend>) {
    let settings = store(backend);
    settings.get(8).await.unwrap();

    // Replacing the record clears fields the new record leaves unset...
    let mut record = ChatSettings::empty(8);
    record.model = Some("replacement".to_string());
    settings.upsert(&record).await.unwrap();
    let stored = settings.get_stored(8).await.unwrap().unwrap();
    assert_eq!(stored.model.as_deref(), Some("replacement"));
    assert!(stored.conversation_style.is_none());

    // ...and the next read fills them back from defaults.
    let resolved = settings.get(8).await.unwrap();
    assert_eq!(resolved.model, "replacement");
    assert_eq!(resolved.conversation_style, "sarcastic");

    let mut invalid = ChatSettings::empty(8);
    invalid.temperature = Some(-1.0);
    assert!(matches!(
        settings.upsert(&invalid).await.unwrap_err(),
        StorageError::Validation(_)
    ));
}

async fn check_concurrent_first_reads(backend: Arc<dyn StorageBackend>) {
    let settings = store(backend);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let settings = settings.clone();
        handles.push(tokio::spawn(async move { settings.get(9).await }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]));

    let stored = settings.get_stored(9).await.unwrap().unwrap();
    assert!(stored.is_complete());
    assert_eq!(stored.resolve(settings.defaults()), results[0]);
}

#[tokio::test]
async fn test_sqlite_injected_defaults() {
    let (_dir, backend) = sqlite_backend().await;
    check_injected_defaults(backend).await;
}

#[tokio::test]
async fn test_file_injected_defaults() {
    let (_dir, backend) = file_backend().await;
    check_injected_defaults(backend).await;
}

#[tokio::test]
async fn test_sqlite_text_validation() {
    let (_dir, backend) = sqlite_backend().await;
    check_text_validation(backend).await;
}

#[tokio::test]
async fn test_file_text_validation() {
    let (_dir, backend) = file_backend().await;
    check_text_validation(backend).await;
}

#[tokio::test]
async fn test_sqlite_whole_record_upsert() {
    let (_dir, backend) = sqlite_backend().await;
    check_whole_record_upsert(backend).await;
}

#[tokio::test]
async fn test_file_whole_record_upsert() {
    let (_dir, backend) = file_backend().await;
    check_whole_record_upsert(backend).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_first_reads() {
    let (_dir, backend) = sqlite_backend().await;
    check_concurrent_first_reads(backend).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_file_concurrent_first_reads() {
    let (_dir, backend) = file_backend().await;
    check_concurrent_first_reads(backend).await;
}
