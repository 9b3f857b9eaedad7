//! OBD-II Data Logger
//!
//! Samples a configured set of mode 01 PIDs from an ELM327 adapter at a
//! fixed rate and stores every complete pass as a row, grouped into trips
//! that follow the engine running.

mod collector;
mod config;
mod error;
mod report;

pub use collector::{
    Collector, CollectorHandle, CollectorReport, CollectorSettings, StopReason,
};
pub use config::{LoggerConfig, DEFAULT_CONFIG_FILE};
pub use error::LoggerError;
pub use report::{capability_report, error_code_report, format_capabilities, supported_columns};

use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;

/// Install the global subscriber; `RUST_LOG` wins over `verbose`
pub fn init_logging(verbose: bool, json: bool) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::builder()
        .with_default_directive(if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO }.into())
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
