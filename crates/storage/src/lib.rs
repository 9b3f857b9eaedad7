//! Storage Layer
//!
//! Persists logged samples and trip boundaries. [`SampleSink`] is all the
//! logger sees; [`MemoryRepository`] keeps rows in memory and
//! [`SqliteRepository`] writes the `obd` and `trip` tables.

mod repository;
mod sink;
mod sqlite;

pub use repository::MemoryRepository;
pub use sink::{Sample, SampleSink, TripRecord};
pub use sqlite::SqliteRepository;

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Invalid column name: {0}")]
    InvalidColumn(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::DatabaseError(other.to_string()),
        }
    }
}
