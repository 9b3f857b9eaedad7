//! ELM327 Adapter Simulator
//!
//! Impersonates an ELM327 OBD-II adapter for testing loggers without a car.
//! Up to six simulated ECUs answer requests from pluggable value sources,
//! each with its own reply delay, on any of the adapter's bus protocols.

mod at_command;
mod ecu;
mod engine;
mod error;
mod generator;
mod port;
mod settings;

pub use at_command::{handle_at_command, AdapterIdentity, AtReply};
pub use ecu::{delay_order, schedule, Ecu, EcuSet, FreezeFrame, FreezeFrameStore, MAX_ECUS, MAX_FREEZE_FRAMES};
pub use engine::{format_error_lines, format_freeze_reply, format_value_reply, Flow, ResponderEngine, TICK};
pub use error::SimError;
pub use generator::{
    create_generator, find_generator, CycleSource, ErrorReport, ErrorSource, GeneratorInfo,
    RandomSource, Reading, ValueSource, DEFAULT_GENERATOR, GENERATORS,
};
#[cfg(target_os = "linux")]
pub use port::PtyPort;
pub use port::{open_tty, LineBuffer, SimPort, StreamPort, TcpPort, MAX_LINE_LENGTH};
pub use settings::{
    SimSettings, DEFAULT_BATTERY_VOLTAGE, DEFAULT_DEVICE_IDENTIFIER, DEFAULT_ELM_DEVICE,
    DEFAULT_ELM_VERSION, DEFAULT_TIMEOUT_MS,
};

use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber. `RUST_LOG` overrides the level picked by
/// `verbose`.
pub fn init_logging(verbose: bool, json: bool) -> Result<(), SetGlobalDefaultError> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
}
