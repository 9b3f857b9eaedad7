//! OBD-II Error Types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of a single request/response exchange with the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObdStatus {
    /// Reply parsed and matched the request
    Success,
    /// Adapter answered "NO DATA"
    NoData,
    /// Reply did not follow the line grammar, or the adapter answered "?"
    Unparsable,
    /// Response code was not `0x40 + mode`
    InvalidResponse,
    /// Echoed PID did not match the requested PID
    InvalidMode,
    /// Adapter could not reach the vehicle bus
    UnableToConnect,
    /// Transport failure or timeout with nothing read
    Error,
}

impl ObdStatus {
    /// Whether this status carries data
    pub fn is_success(&self) -> bool {
        matches!(self, ObdStatus::Success)
    }

    /// Whether this is a protocol-level negative answer rather than a fault
    pub fn is_semantic(&self) -> bool {
        matches!(self, ObdStatus::NoData | ObdStatus::UnableToConnect)
    }
}

impl fmt::Display for ObdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObdStatus::Success => "success",
            ObdStatus::NoData => "no data",
            ObdStatus::Unparsable => "unparsable reply",
            ObdStatus::InvalidResponse => "invalid response code",
            ObdStatus::InvalidMode => "mismatched PID echo",
            ObdStatus::UnableToConnect => "unable to connect",
            ObdStatus::Error => "transport error",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during OBD-II communication
#[derive(Debug, Error)]
pub enum ObdError {
    /// Serial port connection error
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Timeout waiting for response
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// The adapter answered, but not with data
    #[error("OBD query failed: {0}")]
    Status(ObdStatus),

    /// Protocol identifier not in the adapter's protocol table
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Malformed diagnostic trouble code string
    #[error("Invalid DTC: {0:?}")]
    InvalidDtc(String),

    /// Column name not present in the PID catalog
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    /// Baud rate negotiation failed
    #[error("Baud rate negotiation failed: {0}")]
    BaudRate(String),

    /// Adapter not responding
    #[error("OBD adapter not responding")]
    AdapterNotResponding,

    /// Engine used in the wrong state
    #[error("Requester is {0}, expected ready")]
    NotReady(&'static str),
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<tokio_serial::Error> for ObdError {
    fn from(err: tokio_serial::Error) -> Self {
        ObdError::SerialError(err.to_string())
    }
}

impl From<ObdStatus> for ObdError {
    fn from(status: ObdStatus) -> Self {
        ObdError::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(ObdStatus::Success.is_success());
        assert!(ObdStatus::NoData.is_semantic());
        assert!(ObdStatus::UnableToConnect.is_semantic());
        assert!(!ObdStatus::InvalidMode.is_semantic());
        assert!(!ObdStatus::Error.is_success());
    }

    #[test]
    fn test_status_error_message() {
        let err: ObdError = ObdStatus::NoData.into();
        assert_eq!(err.to_string(), "OBD query failed: no data");
    }
}
