//! Error types for the archive service.

use thiserror::Error;

/// Errors that can occur during archive operations.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A binary already exists at the address and `force` was not set.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed or missing required input.
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Reference to a resource that does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// External indexing tool returned a non-benign error.
    #[error("{command} failed with status {code:?}: {stderr}")]
    ToolFailure {
        /// The command that was invoked.
        command: String,
        /// Process exit code, if the process exited at all.
        code: Option<i32>,
        /// Captured standard error output.
        stderr: String,
    },

    /// Unique-key race during ancestor creation.
    #[error("Store conflict: {0}")]
    StoreConflict(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

impl ArchiveError {
    /// Whether a caller can recover by retrying the read that raced.
    pub fn is_store_conflict(&self) -> bool {
        match self {
            ArchiveError::StoreConflict(_) => true,
            ArchiveError::Database(sqlx::Error::Database(db)) => {
                // 23505 is PostgreSQL unique_violation
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = ArchiveError::Conflict("file already exists".to_string());
        assert_eq!(err.to_string(), "Conflict: file already exists");
    }

    #[test]
    fn test_tool_failure_display() {
        let err = ArchiveError::ToolFailure {
            command: "reprepro".to_string(),
            code: Some(255),
            stderr: "boom".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("reprepro"));
        assert!(rendered.contains("255"));
    }

    #[test]
    fn test_store_conflict_detection() {
        assert!(ArchiveError::StoreConflict("dup".to_string()).is_store_conflict());
        assert!(!ArchiveError::Invalid("nope".to_string()).is_store_conflict());
    }
}
