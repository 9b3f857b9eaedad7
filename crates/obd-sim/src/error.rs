//! Simulator Error Types

use obd_protocol::ObdError;
use thiserror::Error;

/// Errors raised while configuring or running the simulator
#[derive(Debug, Error)]
pub enum SimError {
    /// Port could not be opened or used
    #[error("Sim port error: {0}")]
    Port(String),

    /// The client closed its end of the port
    #[error("Client disconnected")]
    Disconnected,

    /// No generator registered under this name
    #[error("Unknown generator: {0}")]
    UnknownGenerator(String),

    /// Generator rejected its seed
    #[error("Invalid seed {seed:?} for generator {generator}")]
    InvalidSeed { generator: &'static str, seed: String },

    /// More ECUs requested than the simulator supports
    #[error("Too many ECUs: {0} (max {max})", max = crate::ecu::MAX_ECUS)]
    TooManyEcus(usize),

    /// Protocol table or codec error
    #[error(transparent)]
    Protocol(#[from] ObdError),
}

impl From<std::io::Error> for SimError {
    fn from(err: std::io::Error) -> Self {
        SimError::Port(err.to_string())
    }
}

impl From<tokio_serial::Error> for SimError {
    fn from(err: tokio_serial::Error) -> Self {
        SimError::Port(err.to_string())
    }
}
