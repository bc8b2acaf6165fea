//! Backend selection at process start.

use std::sync::Arc;

use tracing::info;

use crate::backend::StorageBackend;
use crate::config::{BackendKind, StorageConfig};
use crate::error::Result;
use crate::file::FileBackend;
use crate::sqlite::SqliteBackend;

/// Opens the backend named by `config.backend` and checks it is reachable.
pub async fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Sqlite => Arc::new(SqliteBackend::new(&config.database_url).await?),
        BackendKind::File => Arc::new(FileBackend::open(&config.file_store_dir).await?),
        BackendKind::Lance => open_lance(config).await?,
    };
    backend.health_check().await?;
    info!(
        backend = backend.name(),
        vector_search = backend.capabilities().vector_search,
        "Storage backend ready"
    );
    Ok(backend)
}

#[cfg(feature = "lance")]
async fn open_lance(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    use crate::lance::{LanceBackend, LanceConfig};

    let lance_config = LanceConfig {
        db_path: config.lance_db_path.clone(),
        embedding_dim: config.embedding_dim,
        vector_index_name: config.vector_index_name.clone(),
        ..Default::default()
    };
    Ok(Arc::new(LanceBackend::with_config(lance_config).await?))
}

#[cfg(not(feature = "lance"))]
async fn open_lance(_config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    Err(crate::error::StorageError::Config(
        "STORAGE_BACKEND=lance requires building with the `lance` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_file_backend() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: BackendKind::File,
            file_store_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let backend = open_backend(&config).await.unwrap();
        assert_eq!(backend.name(), "file");
        assert!(backend.capabilities().vector_search);
    }

    #[tokio::test]
    async fn test_open_sqlite_backend() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: BackendKind::Sqlite,
            database_url: dir.path().join("nested/db.sqlite").to_string_lossy().to_string(),
            ..Default::default()
        };
        let backend = open_backend(&config).await.unwrap();
        assert_eq!(backend.name(), "sqlite");
        assert!(!backend.capabilities().vector_search);
    }

    #[cfg(not(feature = "lance"))]
    #[tokio::test]
    async fn test_lance_requires_feature() {
        let config = StorageConfig {
            backend: BackendKind::Lance,
            ..Default::default()
        };
        let err = open_backend(&config).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
