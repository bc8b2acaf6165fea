//! Storage error types.
//!
//! Every failure that reaches a caller carries an [`OpContext`] (operation name,
//! chat id, message id) so it can be logged and retried without guessing what
//! was being done. Absent profiles/settings are not errors: lookups return `Option`.

use std::fmt;
use std::time::Duration;

use embedding::EmbeddingError;
use thiserror::Error;

/// Which operation failed, and on what.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpContext {
    pub operation: &'static str,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
}

impl OpContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            chat_id: None,
            message_id: None,
        }
    }

    pub fn chat(operation: &'static str, chat_id: i64) -> Self {
        Self {
            operation,
            chat_id: Some(chat_id),
            message_id: None,
        }
    }

    pub fn message(operation: &'static str, chat_id: i64, message_id: i64) -> Self {
        Self {
            operation,
            chat_id: Some(chat_id),
            message_id: Some(message_id),
        }
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(chat_id) = self.chat_id {
            write!(f, " chat_id={}", chat_id)?;
        }
        if let Some(message_id) = self.message_id {
            write!(f, " message_id={}", message_id)?;
        }
        Ok(())
    }
}

/// Errors that can occur when using storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error ({context}): {message}")]
    Database { context: OpContext, message: String },

    #[error("IO error ({context}): {source}")]
    Io {
        context: OpContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error ({context}): {message}")]
    Serialization { context: OpContext, message: String },

    #[error("Timed out after {after:?} ({context})")]
    Timeout { context: OpContext, after: Duration },

    #[error("Operation {operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Embedding provider error: {0}")]
    Provider(#[from] EmbeddingError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn database(context: OpContext, err: impl fmt::Display) -> Self {
        Self::Database {
            context,
            message: err.to_string(),
        }
    }

    pub fn io(context: OpContext, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub fn serialization(context: OpContext, err: impl fmt::Display) -> Self {
        Self::Serialization {
            context,
            message: err.to_string(),
        }
    }

    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    /// True when the active backend does not implement the operation at all
    /// (as opposed to implementing it and finding nothing).
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Transient failures worth retrying on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Io { .. } | Self::Timeout { .. } | Self::Provider(_)
        )
    }

    /// Context of the failed operation, when the variant carries one.
    pub fn context(&self) -> Option<&OpContext> {
        match self {
            Self::Database { context, .. }
            | Self::Io { context, .. }
            | Self::Serialization { context, .. }
            | Self::Timeout { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Result type for storage operations; uses [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        assert_eq!(OpContext::new("list_chat_ids").to_string(), "list_chat_ids");
        assert_eq!(OpContext::chat("get_recent", 7).to_string(), "get_recent chat_id=7");
        assert_eq!(
            OpContext::message("set_embedding", -100, 42).to_string(),
            "set_embedding chat_id=-100 message_id=42"
        );
    }

    #[test]
    fn test_database_error_carries_context() {
        let err = StorageError::database(OpContext::message("add", 1, 2), "disk full");
        assert_eq!(err.to_string(), "Database error (add chat_id=1 message_id=2): disk full");
        assert_eq!(err.context().and_then(|c| c.message_id), Some(2));
        assert!(err.is_retryable());
        assert!(!err.is_unsupported());
    }

    #[test]
    fn test_unsupported() {
        let err = StorageError::unsupported("sqlite", "search_similar");
        assert!(err.is_unsupported());
        assert!(!err.is_retryable());
        assert!(err.context().is_none());
        assert_eq!(
            err.to_string(),
            "Operation search_similar is not supported by the sqlite backend"
        );
    }

    #[test]
    fn test_provider_error_from() {
        let err: StorageError = EmbeddingError::EmptyInput.into();
        assert!(matches!(err, StorageError::Provider(EmbeddingError::EmptyInput)));
    }
}
