//! StorageFacade integration tests: ingest-time embedding, semantic search and
//! its degradation on backends without vectors.

mod common;

use std::sync::Arc;

use chat_storage::{StorageConfig, StorageError};
use embedding::EmbeddingService;

use common::{facade, file_backend, ids, memory_config, msg, sqlite_backend, HashEmbedding, DIM};

#[tokio::test]
async fn test_add_message_attaches_vector() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend, Some(embedder.clone()), &memory_config());

    store.add_message(&msg(1, 1, 0, "hello there")).await.unwrap();
    // Nothing to embed.
    store.add_message(&msg(1, 2, 1, "")).await.unwrap();

    let stored = store.get_message(1, 1).await.unwrap().unwrap();
    assert_eq!(stored.embedding, Some(embedder.vector_for("hello there")));
    assert!(store.get_message(1, 2).await.unwrap().unwrap().embedding.is_none());
    assert_eq!(embedder.calls(), 1);
}

#[tokio::test]
async fn test_add_message_survives_provider_failure() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM).failing_on("poison"));
    let store = facade(backend, Some(embedder.clone()), &memory_config());

    store.add_message(&msg(1, 1, 0, "poison")).await.unwrap();

    let stored = store.get_message(1, 1).await.unwrap().expect("message must be stored");
    assert_eq!(stored.text, "poison");
    assert!(stored.embedding.is_none());
    assert_eq!(embedder.calls(), 1);
}

#[tokio::test]
async fn test_add_message_without_long_term_memory() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend, Some(embedder.clone()), &StorageConfig::default());

    store.add_message(&msg(1, 1, 0, "hello")).await.unwrap();
    assert!(store.get_message(1, 1).await.unwrap().unwrap().embedding.is_none());
    assert_eq!(embedder.calls(), 0);
    assert!(!store.semantic_search_enabled());
}

#[tokio::test]
async fn test_duplicate_add_keeps_stored_vector() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend.clone(), Some(embedder.clone()), &memory_config());
    store.add_message(&msg(1, 1, 0, "hello there")).await.unwrap();
    let vector = embedder.vector_for("hello there");

    // Redelivery with a working provider reuses the vector.
    store.add_message(&msg(1, 1, 0, "hello there")).await.unwrap();
    assert_eq!(embedder.calls(), 1);

    // Redelivery while the provider fails.
    let failing = Arc::new(HashEmbedding::new(DIM).failing_on("hello there"));
    let store = facade(backend.clone(), Some(failing.clone()), &memory_config());
    store.add_message(&msg(1, 1, 0, "hello there")).await.unwrap();
    assert_eq!(failing.calls(), 0);
    assert_eq!(
        store.get_message(1, 1).await.unwrap().unwrap().embedding,
        Some(vector.clone())
    );

    // Redelivery with long-term memory off.
    let store = facade(backend, None, &StorageConfig::default());
    store.add_message(&msg(1, 1, 0, "hello there")).await.unwrap();
    assert_eq!(
        store.get_message(1, 1).await.unwrap().unwrap().embedding,
        Some(vector)
    );
}

#[tokio::test]
async fn test_edited_message_is_embedded_again() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend.clone(), Some(embedder.clone()), &memory_config());
    store.add_message(&msg(1, 1, 0, "hello there")).await.unwrap();

    store.add_message(&msg(1, 1, 0, "goodbye now")).await.unwrap();
    let stored = store.get_message(1, 1).await.unwrap().unwrap();
    assert_eq!(stored.text, "goodbye now");
    assert_eq!(stored.embedding, Some(embedder.vector_for("goodbye now")));
    assert_eq!(embedder.calls(), 2);

    // New text with no provider drops the outdated vector.
    let store = facade(backend, None, &StorageConfig::default());
    store.add_message(&msg(1, 1, 0, "third version")).await.unwrap();
    assert!(store.get_message(1, 1).await.unwrap().unwrap().embedding.is_none());
}

#[tokio::test]
async fn test_search_relevant_ranks_by_similarity() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend, Some(embedder.clone()), &memory_config());

    store.add_message(&msg(1, 1, 0, "rust async tokio runtime")).await.unwrap();
    store.add_message(&msg(1, 2, 1, "cooking pasta recipe")).await.unwrap();
    store.add_message(&msg(1, 3, 2, "tokio tasks")).await.unwrap();
    // Same words in another chat must never leak into chat 1 results.
    store.add_message(&msg(2, 4, 3, "tokio async")).await.unwrap();

    let results = store.search_relevant(1, "tokio async", 2).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].message.message_id, 1);
    assert!(results.iter().all(|r| r.message.chat_id == 1));
    assert!(results[0].score >= results[1].score);

    let history = store.relevant_history(1, "pasta recipe", 1).await.unwrap();
    assert_eq!(ids(&history), vec![2]);
}

#[tokio::test]
async fn test_search_relevant_blank_query_skips_provider() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend, Some(embedder.clone()), &memory_config());

    assert!(store.search_relevant(1, "", 5).await.unwrap().is_empty());
    assert!(store.search_relevant(1, "   ", 5).await.unwrap().is_empty());
    assert!(store.search_relevant(1, "anything", 0).await.unwrap().is_empty());
    assert_eq!(embedder.calls(), 0);
}

#[tokio::test]
async fn test_search_relevant_disabled_returns_empty() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend.clone(), Some(embedder.clone()), &StorageConfig::default());
    assert!(store.search_relevant(1, "hello", 5).await.unwrap().is_empty());
    assert_eq!(embedder.calls(), 0);

    let no_embedder = facade(backend, None, &memory_config());
    assert!(no_embedder.search_relevant(1, "hello", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_search_relevant_unsupported_on_sqlite() {
    let (_dir, backend) = sqlite_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM));
    let store = facade(backend, Some(embedder.clone()), &memory_config());

    store.add_message(&msg(1, 1, 0, "hello world")).await.unwrap();
    // SQLite stores no vectors, so ingest never calls the provider.
    assert_eq!(embedder.calls(), 0);

    let err = store.search_relevant(1, "hello", 5).await.unwrap_err();
    assert!(err.is_unsupported(), "expected Unsupported, got {err}");
    assert!(matches!(err, StorageError::Unsupported { backend: "sqlite", .. }));
    assert_eq!(embedder.calls(), 0);

    // The conversation-facing variant degrades to "nothing relevant".
    assert!(store.relevant_history(1, "hello", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relevant_history_swallows_provider_errors() {
    let (_dir, backend) = file_backend().await;
    let embedder = Arc::new(HashEmbedding::new(DIM).failing_on("bad query"));
    let store = facade(backend, Some(embedder.clone()), &memory_config());
    store.add_message(&msg(1, 1, 0, "hello")).await.unwrap();

    let err = store.search_relevant(1, "bad query", 3).await.unwrap_err();
    assert!(matches!(err, StorageError::Provider(_)));
    assert!(store.relevant_history(1, "bad query", 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recent_context_uses_window() {
    let (_dir, backend) = file_backend().await;
    let store = facade(backend, None, &memory_config());
    for id in 1..=5 {
        store.add_message(&msg(1, id, id, "m")).await.unwrap();
    }
    // memory_config() sets a window of 3.
    assert_eq!(ids(&store.recent_context(1).await.unwrap()), vec![3, 4, 5]);
}

#[tokio::test]
async fn test_embed_batch_default() {
    let embedder: Arc<dyn EmbeddingService> = Arc::new(HashEmbedding::new(8));
    let batch = embedder
        .embed_batch(&["a b".to_string(), "c".to_string()])
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|v| v.len() == 8));
}
