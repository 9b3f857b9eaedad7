//! OBD-II Protocol Definitions
//!
//! The ELM327 protocol table and the per-bus header layouts used when an
//! adapter has headers turned on.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header layout families. There are 13 protocols but only six layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderType {
    /// No header at all
    Null,
    J1850Pwm,
    /// Also used by ISO 9141-2
    J1850Vpw,
    Iso14230,
    /// 29-bit CAN identifier
    Can29,
    /// 11-bit CAN identifier
    Can11,
}

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
    /// SAE J1939 (29 bit ID, 250 kbaud)
    SaeJ1939,
    /// User-defined CAN slot 1
    User1Can,
    /// User-defined CAN slot 2
    User2Can,
}

impl ObdProtocol {
    /// Every protocol, in ELM327 numbering order
    pub const ALL: [ObdProtocol; 13] = [
        ObdProtocol::Auto,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141_2,
        ObdProtocol::Iso14230_4Kwp,
        ObdProtocol::Iso14230_4KwpFast,
        ObdProtocol::Iso15765_4Can11bit500,
        ObdProtocol::Iso15765_4Can29bit500,
        ObdProtocol::Iso15765_4Can11bit250,
        ObdProtocol::Iso15765_4Can29bit250,
        ObdProtocol::SaeJ1939,
        ObdProtocol::User1Can,
        ObdProtocol::User2Can,
    ];

    /// The single-character protocol number used by `ATSP`/`ATDPN`
    pub fn number(&self) -> char {
        match self {
            ObdProtocol::Auto => '0',
            ObdProtocol::J1850Pwm => '1',
            ObdProtocol::J1850Vpw => '2',
            ObdProtocol::Iso9141_2 => '3',
            ObdProtocol::Iso14230_4Kwp => '4',
            ObdProtocol::Iso14230_4KwpFast => '5',
            ObdProtocol::Iso15765_4Can11bit500 => '6',
            ObdProtocol::Iso15765_4Can29bit500 => '7',
            ObdProtocol::Iso15765_4Can11bit250 => '8',
            ObdProtocol::Iso15765_4Can29bit250 => '9',
            ObdProtocol::SaeJ1939 => 'A',
            ObdProtocol::User1Can => 'B',
            ObdProtocol::User2Can => 'C',
        }
    }

    /// Look a protocol up by its number
    pub fn from_number(c: char) -> Option<Self> {
        let c = c.to_ascii_uppercase();
        Self::ALL.iter().copied().find(|p| p.number() == c)
    }

    /// Description as reported by `ATDP`
    pub fn description(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "Automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW",
            ObdProtocol::Iso9141_2 => "ISO 9141-2",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 (KWP 5BAUD)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 (KWP FAST)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 (CAN 11/500)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 (CAN 29/500)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 (CAN 11/250)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 (CAN 29/250)",
            ObdProtocol::SaeJ1939 => "SAE J1939 (CAN 29/250)",
            ObdProtocol::User1Can => "USER1 CAN",
            ObdProtocol::User2Can => "USER2 CAN",
        }
    }

    /// Header layout this protocol renders
    pub fn header_type(&self) -> HeaderType {
        match self {
            ObdProtocol::Auto => HeaderType::Null,
            ObdProtocol::J1850Pwm => HeaderType::J1850Pwm,
            ObdProtocol::J1850Vpw | ObdProtocol::Iso9141_2 => HeaderType::J1850Vpw,
            ObdProtocol::Iso14230_4Kwp | ObdProtocol::Iso14230_4KwpFast => HeaderType::Iso14230,
            ObdProtocol::Iso15765_4Can11bit500
            | ObdProtocol::Iso15765_4Can11bit250
            | ObdProtocol::User1Can
            | ObdProtocol::User2Can => HeaderType::Can11,
            ObdProtocol::Iso15765_4Can29bit500
            | ObdProtocol::Iso15765_4Can29bit250
            | ObdProtocol::SaeJ1939 => HeaderType::Can29,
        }
    }

    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{}", self.number())
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(self.header_type(), HeaderType::Can11 | HeaderType::Can29)
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Iso15765_4Can11bit250
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.number(), self.description())
    }
}

/// A protocol plus the adapter's "auto" flag, as set by `ATSP`/`ATTP`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSelection {
    pub protocol: ObdProtocol,
    pub auto: bool,
}

impl Default for ProtocolSelection {
    fn default() -> Self {
        Self {
            protocol: ObdProtocol::default(),
            auto: true,
        }
    }
}

impl FromStr for ProtocolSelection {
    type Err = ObdError;

    /// Accepts `[A]<n>[A]` with optional spaces, e.g. `8`, `A8`, `6 A`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ObdError::UnknownProtocol(s.to_string());
        let mut rest = s.trim_start();
        let mut auto = false;
        if let Some(stripped) = rest.strip_prefix(|c: char| c.eq_ignore_ascii_case(&'A')) {
            auto = true;
            rest = stripped.trim_start();
        }
        let mut chars = rest.chars();
        let protocol = chars
            .next()
            .and_then(ObdProtocol::from_number)
            .ok_or_else(unknown)?;
        if matches!(chars.as_str().trim_start().chars().next(), Some('A' | 'a')) {
            auto = true;
        }
        Ok(Self { protocol, auto })
    }
}

/// Render the header that precedes a reply line from one ECU.
///
/// `ecu_address` is the logical ECU index; the bus address is derived
/// from it here. `payload_len` is the message length byte where the
/// layout carries one.
pub fn render_header(
    header_type: HeaderType,
    ecu_address: u8,
    payload_len: u8,
    spaces: bool,
    dlc: bool,
) -> String {
    let sp = if spaces { " " } else { "" };
    let dlc_str = if dlc {
        format!("{:01X}{}", u32::from(payload_len) + 2, sp)
    } else {
        String::new()
    };

    match header_type {
        HeaderType::J1850Pwm => {
            let addr = u32::from(ecu_address) + 0x10;
            format!("41{sp}6B{sp}{:02X}{sp}", addr)
        }
        HeaderType::J1850Vpw => {
            let addr = u32::from(ecu_address) + 0x10;
            format!("48{sp}6B{sp}{:02X}{sp}", addr)
        }
        HeaderType::Iso14230 => {
            let addr = u32::from(ecu_address) + 0x10;
            format!("{:02X}{sp}F1{sp}{:02X}{sp}", 0x80 | u32::from(payload_len), addr)
        }
        HeaderType::Can29 => {
            let id = u32::from(ecu_address) + 0x18DA_F110;
            let [b0, b1, b2, b3] = id.to_be_bytes();
            format!(
                "{:02X}{sp}{:02X}{sp}{:02X}{sp}{:02X}{sp}{:02X}{sp}{}",
                b0, b1, b2, b3, payload_len, dlc_str
            )
        }
        HeaderType::Can11 => {
            let id = u32::from(ecu_address) + 0x7E8;
            format!("{:03X}{sp}{:02X}{sp}{}", id, payload_len, dlc_str)
        }
        HeaderType::Null => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can11_header() {
        let header = render_header(HeaderType::Can11, 0, 4, true, false);
        assert_eq!(header, "7E8 04 ");
        assert!(header.starts_with("7E8"));
        assert_eq!(render_header(HeaderType::Can11, 1, 4, false, false), "7E904");
    }

    #[test]
    fn test_can29_header() {
        let header = render_header(HeaderType::Can29, 2, 4, true, false);
        assert!(header.starts_with("18 DA F1 12"));
        assert_eq!(header, "18 DA F1 12 04 ");
    }

    #[test]
    fn test_dlc_appended() {
        assert_eq!(render_header(HeaderType::Can11, 0, 4, true, true), "7E8 04 6 ");
        assert_eq!(render_header(HeaderType::Can11, 0, 4, false, true), "7E8046");
    }

    #[test]
    fn test_legacy_headers() {
        assert_eq!(render_header(HeaderType::J1850Pwm, 0, 4, true, false), "41 6B 10 ");
        assert_eq!(render_header(HeaderType::J1850Vpw, 1, 4, false, false), "486B11");
        assert_eq!(render_header(HeaderType::Iso14230, 0, 4, true, false), "84 F1 10 ");
        assert_eq!(render_header(HeaderType::Null, 3, 4, true, true), "");
    }

    #[test]
    fn test_protocol_table() {
        assert_eq!(ObdProtocol::from_number('8'), Some(ObdProtocol::Iso15765_4Can11bit250));
        assert_eq!(ObdProtocol::from_number('a'), Some(ObdProtocol::SaeJ1939));
        assert_eq!(ObdProtocol::from_number('D'), None);
        assert_eq!(ObdProtocol::Iso9141_2.header_type(), HeaderType::J1850Vpw);
        assert_eq!(ObdProtocol::J1850Pwm.to_elm_command(), "ATSP1");
        assert!(ObdProtocol::SaeJ1939.is_can());
    }

    #[test]
    fn test_protocol_selection() {
        let sel: ProtocolSelection = "8".parse().unwrap();
        assert_eq!(sel.protocol, ObdProtocol::Iso15765_4Can11bit250);
        assert!(!sel.auto);

        let sel: ProtocolSelection = "A6".parse().unwrap();
        assert_eq!(sel.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert!(sel.auto);

        let sel: ProtocolSelection = " 3 A".parse().unwrap();
        assert_eq!(sel.protocol, ObdProtocol::Iso9141_2);
        assert!(sel.auto);

        assert!("Z".parse::<ProtocolSelection>().is_err());
        assert!("".parse::<ProtocolSelection>().is_err());
    }
}
