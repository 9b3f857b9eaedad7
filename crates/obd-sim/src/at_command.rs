//! AT command handling
//!
//! Commands arrive uppercased with the leading `AT` still attached. Matching
//! is prefix based and tolerant of trailing text, like the adapter firmware.

use crate::settings::{SimSettings, DEFAULT_TIMEOUT_MS};
use obd_protocol::ProtocolSelection;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info};

/// Strings the simulated adapter identifies itself with
#[derive(Debug, Clone)]
pub struct AdapterIdentity {
    /// `ATI`, `ATZ` and `ATWS` reply
    pub version: String,
    /// `AT@1` reply
    pub device: String,
}

/// Outcome of a recognised command
#[derive(Debug, Clone, PartialEq)]
pub struct AtReply {
    pub text: String,
    /// Simulated processing time before the reply is sent
    pub delay: Duration,
}

impl AtReply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay: Duration::ZERO,
        }
    }

    fn ok() -> Self {
        Self::text("OK")
    }
}

/// Leading decimal integer, whitespace and sign allowed
fn scan_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let value: i64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Leading hex number of at most `max_digits` digits
fn scan_hex(s: &str, max_digits: usize) -> Option<u32> {
    let digits: String = s
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .take(max_digits)
        .collect();
    u32::from_str_radix(&digits, 16).ok()
}

fn flag(rest: &str) -> Option<bool> {
    scan_int(rest).map(|v| v != 0)
}

/// Time a reset takes at the current timing settings
fn reset_delay(settings: &SimSettings, factor: u64) -> Duration {
    Duration::from_millis(settings.timeout_ms * factor / (u64::from(settings.adaptive_timing) + 1))
}

/// Apply one AT command to `settings`. `None` means the command is not
/// recognised and the adapter answers `?`.
pub fn handle_at_command(
    line: &str,
    settings: &mut SimSettings,
    identity: &AdapterIdentity,
) -> Option<AtReply> {
    let body = line.strip_prefix("AT")?.trim_start();
    debug!("AT command: {}", body);

    if let Some(v) = body.strip_prefix("AT").and_then(scan_int) {
        if (0..=2).contains(&v) {
            settings.adaptive_timing = v as u8;
            return Some(AtReply::ok());
        }
        return None;
    }
    if let Some(on) = body.strip_prefix('L').and_then(flag) {
        settings.linefeed = on;
        return Some(AtReply::ok());
    }
    if let Some(on) = body.strip_prefix('H').and_then(flag) {
        settings.headers = on;
        return Some(AtReply::ok());
    }
    if let Some(rest) = body.strip_prefix("SP").or_else(|| body.strip_prefix("TP")) {
        let selection: ProtocolSelection = rest.trim().parse().ok()?;
        info!("Switching protocol to {}", selection.protocol.description());
        settings.protocol = selection;
        return Some(AtReply::ok());
    }
    if let Some(v) = body.strip_prefix("ST").and_then(|r| scan_hex(r, 2)) {
        settings.timeout_ms = if v == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            4 * u64::from(v)
        };
        return Some(AtReply::ok());
    }
    if let Some(on) = body.strip_prefix('S').and_then(flag) {
        settings.spaces = on;
        return Some(AtReply::ok());
    }
    if let Some(on) = body.strip_prefix('E').and_then(flag) {
        settings.echo = on;
        return Some(AtReply::ok());
    }
    if let Some(rest) = body.strip_prefix('@').map(str::trim_start) {
        return match scan_hex(rest, 1)? {
            1 => Some(AtReply::text(identity.device.as_str())),
            2 => Some(AtReply::text(settings.device_identifier.as_str())),
            3 => {
                settings.device_identifier = rest[1..].trim().to_string();
                Some(AtReply::ok())
            }
            _ => None,
        };
    }
    if let Some(rest) = body.strip_prefix("CV") {
        let digits: String = rest.trim_start().chars().take(4).collect();
        let centivolts = scan_int(&digits)?;
        settings.battery_voltage = centivolts as f32 / 100.0;
        return Some(AtReply::ok());
    }
    if body.starts_with("RV") {
        let jitter: f32 = rand::thread_rng().gen::<f32>() - 0.5;
        return Some(AtReply::text(format!("{:.1}", settings.battery_voltage + jitter)));
    }
    if body.starts_with("DPN") {
        let prefix = if settings.protocol.auto { "A" } else { "" };
        return Some(AtReply::text(format!(
            "{}{}",
            prefix,
            settings.protocol.protocol.number()
        )));
    }
    if body.starts_with("DP") {
        let prefix = if settings.protocol.auto { "Auto, " } else { "" };
        return Some(AtReply::text(format!(
            "{}{}",
            prefix,
            settings.protocol.protocol.description()
        )));
    }
    if let Some(on) = body.strip_prefix('D').and_then(flag) {
        settings.dlc = on;
        return Some(AtReply::ok());
    }

    if body.starts_with('I') {
        return Some(AtReply::text(identity.version.as_str()));
    }
    let reply = if body.starts_with('Z') {
        AtReply {
            text: identity.version.clone(),
            delay: reset_delay(settings, 10),
        }
    } else if body.starts_with("WS") {
        AtReply {
            text: identity.version.clone(),
            delay: reset_delay(settings, 5),
        }
    } else if body.starts_with('D') {
        AtReply::ok()
    } else {
        return None;
    };
    info!("Adapter reset ({})", body);
    settings.reset();
    Some(reply)
}
