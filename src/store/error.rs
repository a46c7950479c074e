//! Error types for task-store operations.

use thiserror::Error;

/// Errors that can occur while reading or mutating the task tables.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Task not found.
    #[error("task not found: id {0}")]
    TaskNotFound(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_not_found_message() {
        let err = StoreError::TaskNotFound(42);
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("42"));
    }
}
