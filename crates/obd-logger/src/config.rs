//! Logger configuration
//!
//! Layered lowest to highest: built-in defaults, a TOML file, `OBDLOGGER_*`
//! environment variables. Command line flags are applied on top by the
//! binary.

use crate::error::LoggerError;
use obd_protocol::{BaudSetting, CmdDescriptor, PidCatalog};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// File read when no `--config` is given, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "obdlogger.toml";

const ENV_PREFIX: &str = "OBDLOGGER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Serial device the adapter is attached to
    pub obd_device: String,
    /// SQLite database file
    pub database: String,
    /// Comma separated catalog column names
    pub log_columns: String,
    /// Samples per second, 0 for as fast as the adapter answers
    pub samplerate: u32,
    /// Send byte-count hints with each request
    pub optimisations: bool,
    /// -1 leaves the line alone, 0 guesses, anything else is a rate
    pub baudrate: i64,
    /// Rate to upgrade to after reset; -1 for none, 0 for the fastest that works
    pub baudrate_upgrade: i64,
    /// Trace every line exchanged with the adapter to this file
    pub serial_log: Option<String>,
    /// Stop after this many sampling passes
    pub sample_count: Option<u64>,
    /// Log every value read at INFO
    pub print_values: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            obd_device: "/dev/ttyUSB0".to_string(),
            database: "./obdlogger.db".to_string(),
            log_columns: "temp,rpm,vss,maf,throttlepos".to_string(),
            samplerate: 1,
            optimisations: false,
            baudrate: -1,
            baudrate_upgrade: -1,
            serial_log: None,
            sample_count: None,
            print_values: false,
        }
    }
}

impl LoggerConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when present.
    /// An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, LoggerError> {
        let (file, required) = match path {
            Some(p) => (p.to_string_lossy().into_owned(), true),
            None => (DEFAULT_CONFIG_FILE.to_string(), false),
        };
        debug!("Loading configuration from {} (required: {})", file, required);

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(required))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Catalog entries for `log_columns`
    pub fn columns(&self) -> Result<Vec<&'static CmdDescriptor>, LoggerError> {
        Ok(PidCatalog::parse_columns(&self.log_columns)?)
    }

    /// Time budget of one sampling pass, `None` when unpaced
    pub fn frame_time(&self) -> Option<Duration> {
        match self.samplerate {
            0 => None,
            rate => Some(Duration::from_secs(1) / rate),
        }
    }

    pub fn baud(&self) -> BaudSetting {
        BaudSetting::from_config(self.baudrate)
    }

    pub fn baud_upgrade(&self) -> BaudSetting {
        BaudSetting::from_config(self.baudrate_upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LoggerConfig::default();
        assert_eq!(config.frame_time(), Some(Duration::from_secs(1)));
        assert_eq!(config.baud(), BaudSetting::Keep);
        let pids: Vec<u8> = config.columns().unwrap().iter().map(|c| c.pid).collect();
        assert_eq!(pids, vec![0x05, 0x0C, 0x0D, 0x10, 0x11]);
    }

    #[test]
    fn test_frame_time() {
        let mut config = LoggerConfig::default();
        config.samplerate = 4;
        assert_eq!(config.frame_time(), Some(Duration::from_millis(250)));
        config.samplerate = 0;
        assert_eq!(config.frame_time(), None);
    }

    #[test]
    fn test_load_toml_file() {
        let path = std::env::temp_dir().join(format!("obdlogger-test-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "obd_device = \"/dev/pts/7\"\nlog_columns = \"rpm,vss\"\nsamplerate = 5\nbaudrate = 0\nsample_count = 10"
        )
        .unwrap();
        drop(file);

        let config = LoggerConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.obd_device, "/dev/pts/7");
        assert_eq!(config.samplerate, 5);
        assert_eq!(config.baud(), BaudSetting::Guess);
        assert_eq!(config.sample_count, Some(10));
        // Unset keys keep their defaults
        assert_eq!(config.database, "./obdlogger.db");
        assert_eq!(config.baud_upgrade(), BaudSetting::Keep);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let path = Path::new("/nonexistent/obdlogger.toml");
        assert!(matches!(
            LoggerConfig::load(Some(path)),
            Err(LoggerError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_column() {
        let config = LoggerConfig {
            log_columns: "rpm,warp".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.columns(), Err(LoggerError::Obd(_))));
    }
}
