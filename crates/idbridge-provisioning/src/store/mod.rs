//! Persistence traits and backends.
//!
//! Every service in this crate talks to storage through the traits in the
//! sibling modules ([`crate::account::AccountStore`],
//! [`crate::queue::QueueStore`], ...). Two backends implement them: a
//! Postgres backend used in production and an in-memory backend used by
//! tests and embedders that do not need durability.

pub mod memory;
pub mod postgres;

use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Error from a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or concurrency constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persisted payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Offset/limit pagination for scan queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Number of rows to skip.
    pub offset: u32,
    /// Maximum number of rows to return.
    pub limit: u32,
}

impl Page {
    /// First page with the given size.
    pub fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}
