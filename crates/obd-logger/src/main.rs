//! obdlogger - log OBD-II data to a trip database
//!
//! ```bash
//! obdlogger -s /dev/ttyUSB0 -d car.db -i rpm,vss,temp -a 4
//! ```
//!
//! Settings come from `obdlogger.toml` and `OBDLOGGER_*` variables; flags
//! override both. Send SIGUSR1 to start a new trip, SIGINT to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use obd_logger::{
    capability_report, error_code_report, init_logging, supported_columns, Collector,
    CollectorHandle, CollectorSettings, LoggerConfig, LoggerError,
};
use obd_protocol::{BaudSetting, ObdClient, SerialLog, SerialTransport};
use storage::SqliteRepository;
use tracing::{info, warn};

/// Line speed the port is opened at unless a rate is configured
const ADAPTER_BAUD: u32 = 38400;

#[derive(Parser, Debug)]
#[command(name = "obdlogger", version)]
#[command(about = "Log OBD-II data from an ELM327 adapter")]
struct Args {
    /// Configuration file [default: obdlogger.toml if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device of the adapter
    #[arg(short, long)]
    serial: Option<String>,

    /// Database file
    #[arg(short, long)]
    db: Option<String>,

    /// Comma separated columns to log
    #[arg(short = 'i', long)]
    log_columns: Option<String>,

    /// Samples per second, 0 for as fast as possible
    #[arg(short = 'a', long)]
    samplerate: Option<u32>,

    /// Send expected byte counts with requests
    #[arg(short = 'o', long)]
    enable_optimisations: bool,

    /// Local baud rate: -1 leave alone, 0 guess
    #[arg(short, long, allow_negative_numbers = true)]
    baudrate: Option<i64>,

    /// Upgrade to this baud rate after reset: -1 none, 0 fastest
    #[arg(short = 'B', long, allow_negative_numbers = true)]
    modifybaud: Option<i64>,

    /// Trace adapter traffic to this file
    #[arg(short = 'l', long)]
    serial_log: Option<String>,

    /// Stop after this many samples
    #[arg(short = 'n', long)]
    count: Option<u64>,

    /// Print supported PIDs and stored trouble codes, then exit
    #[arg(short = 'p', long)]
    show_capabilities: bool,

    /// Log every value read
    #[arg(short = 't', long)]
    print_values: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut LoggerConfig) {
        if let Some(serial) = &self.serial {
            config.obd_device.clone_from(serial);
        }
        if let Some(db) = &self.db {
            config.database.clone_from(db);
        }
        if let Some(columns) = &self.log_columns {
            config.log_columns.clone_from(columns);
        }
        if let Some(rate) = self.samplerate {
            config.samplerate = rate;
        }
        if let Some(baud) = self.baudrate {
            config.baudrate = baud;
        }
        if let Some(baud) = self.modifybaud {
            config.baudrate_upgrade = baud;
        }
        if self.serial_log.is_some() {
            config.serial_log.clone_from(&self.serial_log);
        }
        if self.count.is_some() {
            config.sample_count = self.count;
        }
        config.optimisations |= self.enable_optimisations;
        config.print_values |= self.print_values;
    }
}

fn watch_interrupt(handle: CollectorHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, finishing the current sample");
            handle.stop();
        }
    });
}

#[cfg(unix)]
fn watch_trip_signal(handle: CollectorHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot listen for SIGUSR1: {}", e);
                return;
            }
        };
        while usr1.recv().await.is_some() {
            info!("SIGUSR1 received, starting a new trip");
            handle.start_new_trip();
        }
    });
}

#[cfg(not(unix))]
fn watch_trip_signal(_handle: CollectorHandle) {}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.log_json)
        .map_err(|e| anyhow!("Failed to set tracing subscriber: {}", e))?;

    let mut config = LoggerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    let wanted = config.columns()?;

    info!("=== obdlogger v{} ===", env!("CARGO_PKG_VERSION"));

    let open_rate = match config.baud() {
        BaudSetting::Rate(rate) => rate,
        _ => ADAPTER_BAUD,
    };
    let transport = SerialTransport::open(&config.obd_device, open_rate)
        .with_context(|| format!("opening {}", config.obd_device))?;
    let mut client = ObdClient::new(transport);
    if let Some(path) = &config.serial_log {
        client = client.with_serial_log(SerialLog::open(path)?);
    }
    client.open(config.baud(), config.baud_upgrade()).await?;

    if args.show_capabilities {
        for line in capability_report(&mut client).await {
            println!("{}", line);
        }
        println!();
        for line in error_code_report(&mut client).await? {
            println!("{}", line);
        }
        client.close().await?;
        return Ok(());
    }

    let columns = supported_columns(&mut client, &wanted).await;
    if columns.is_empty() {
        client.close().await?;
        return Err(LoggerError::NoColumns(config.log_columns.clone()).into());
    }
    let names: Vec<&str> = columns.iter().filter_map(|c| c.column_name).collect();
    let repo = Arc::new(SqliteRepository::open(&config.database, &names).await?);

    let collector = Collector::new(
        client,
        repo.clone(),
        CollectorSettings::from_config(&config, columns),
    );
    watch_interrupt(collector.handle());
    watch_trip_signal(collector.handle());

    let report = collector.run().await?;
    info!(
        "Logged {} samples in {} passes across {} trips ({:?})",
        report.samples, report.passes, report.trips, report.reason
    );
    repo.close().await;
    Ok(())
}
