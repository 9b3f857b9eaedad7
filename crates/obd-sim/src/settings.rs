//! Simulated adapter session state

use obd_protocol::ProtocolSelection;

/// Default reply timeout, ms
pub const DEFAULT_TIMEOUT_MS: u64 = 200;

/// Battery voltage reported before any `ATCV`
pub const DEFAULT_BATTERY_VOLTAGE: f32 = 11.8;

/// Identifier returned by `AT@2` until changed with `AT@3`
pub const DEFAULT_DEVICE_IDENTIFIER: &str = "ChunkyKs";

/// Reply to `ATZ`, `ATWS` and `ATI`
pub const DEFAULT_ELM_VERSION: &str = "ELM327 v1.3a OBDGPSLogger";

/// Reply to `AT@1`
pub const DEFAULT_ELM_DEVICE: &str = "OBDGPSLogger";

/// Settings toggled by AT commands
#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    pub echo: bool,
    pub headers: bool,
    pub spaces: bool,
    pub linefeed: bool,
    pub timeout_ms: u64,
    /// 0..=2
    pub adaptive_timing: u8,
    pub dlc: bool,
    pub protocol: ProtocolSelection,
    pub device_identifier: String,
    pub battery_voltage: f32,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            echo: true,
            headers: false,
            spaces: true,
            linefeed: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            adaptive_timing: 1,
            dlc: false,
            protocol: ProtocolSelection::default(),
            device_identifier: DEFAULT_DEVICE_IDENTIFIER.to_string(),
            battery_voltage: DEFAULT_BATTERY_VOLTAGE,
        }
    }
}

impl SimSettings {
    pub fn with_protocol(protocol: ProtocolSelection) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Restore output formatting and timing after a reset command.
    /// Protocol, identifier and voltage survive.
    pub fn reset(&mut self) {
        let defaults = Self::default();
        self.echo = defaults.echo;
        self.headers = defaults.headers;
        self.spaces = defaults.spaces;
        self.linefeed = defaults.linefeed;
        self.timeout_ms = defaults.timeout_ms;
        self.adaptive_timing = defaults.adaptive_timing;
        self.dlc = defaults.dlc;
    }

    pub fn newline(&self) -> &'static str {
        if self.linefeed {
            "\r\n"
        } else {
            "\r"
        }
    }

    pub fn separator(&self) -> &'static str {
        if self.spaces {
            " "
        } else {
            ""
        }
    }
}
