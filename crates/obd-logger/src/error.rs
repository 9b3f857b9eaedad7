//! Logger Error Types

use obd_protocol::ObdError;
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("OBD error: {0}")]
    Obd(#[from] ObdError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// None of the requested columns can be logged
    #[error("No loggable columns (requested: {0})")]
    NoColumns(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
