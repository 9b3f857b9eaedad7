//! Diagnostic Trouble Codes
//!
//! Conversion between the 2-byte wire encoding of a DTC and its
//! 5-character human form (`P0104`).

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// System a trouble code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    /// `P`: engine and transmission
    Powertrain,
    /// `C`
    Chassis,
    /// `B`
    Body,
    /// `U`: network and vehicle integration
    Network,
}

impl DtcCategory {
    /// Letter used in the human form
    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }

    /// First value of this category's 4-wide range in the top nibble
    fn nibble_base(&self) -> u8 {
        match self {
            DtcCategory::Powertrain => 0x0,
            DtcCategory::Chassis => 0x4,
            DtcCategory::Body => 0x8,
            DtcCategory::Network => 0xC,
        }
    }

    fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x0..=0x3 => DtcCategory::Powertrain,
            0x4..=0x7 => DtcCategory::Chassis,
            0x8..=0xB => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }
}

/// A decoded diagnostic trouble code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcCode {
    pub category: DtcCategory,
    /// 0..=3
    pub digit: u8,
    /// 0..=0xF
    pub byte_low_nibble: u8,
    pub low_byte: u8,
}

impl DtcCode {
    /// Decode the two wire bytes of a code
    pub fn from_bytes(a: u8, b: u8) -> Self {
        let top = a >> 4;
        Self {
            category: DtcCategory::from_nibble(top),
            digit: top % 4,
            byte_low_nibble: a & 0x0F,
            low_byte: b,
        }
    }

    /// Encode to the two wire bytes
    pub fn to_bytes(&self) -> [u8; 2] {
        let top = self.category.nibble_base() + (self.digit & 0x03);
        [(top << 4) | (self.byte_low_nibble & 0x0F), self.low_byte]
    }

    /// Check the `[PCBU][0-3][0-9A-F]{3}` shape
    pub fn is_valid(code: &str) -> bool {
        let bytes = code.as_bytes();
        bytes.len() == 5
            && DtcCategory::from_letter(bytes[0] as char).is_some()
            && (b'0'..=b'3').contains(&bytes[1])
            && bytes[2..]
                .iter()
                .all(|c| c.is_ascii_digit() || (b'A'..=b'F').contains(c))
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:X}{:02X}",
            self.category.letter(),
            self.digit,
            self.byte_low_nibble,
            self.low_byte
        )
    }
}

impl FromStr for DtcCode {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !DtcCode::is_valid(s) {
            return Err(ObdError::InvalidDtc(s.to_string()));
        }
        let mut chars = s.chars();
        let category = chars
            .next()
            .and_then(DtcCategory::from_letter)
            .ok_or_else(|| ObdError::InvalidDtc(s.to_string()))?;
        let digit = hex_value(&s[1..2], s)?;
        let byte_low_nibble = hex_value(&s[2..3], s)?;
        let low_byte = hex_value(&s[3..5], s)?;
        Ok(Self {
            category,
            digit,
            byte_low_nibble,
            low_byte,
        })
    }
}

fn hex_value(digits: &str, code: &str) -> Result<u8, ObdError> {
    u8::from_str_radix(digits, 16).map_err(|_| ObdError::InvalidDtc(code.to_string()))
}

/// Human form of the two wire bytes
pub fn decode_dtc(a: u8, b: u8) -> String {
    DtcCode::from_bytes(a, b).to_string()
}

/// Wire bytes of a human-form code
pub fn encode_dtc(code: &str) -> Result<[u8; 2], ObdError> {
    Ok(code.parse::<DtcCode>()?.to_bytes())
}

/// Decode the data bytes of a mode 03 reply.
///
/// Codes come in byte pairs; `00 00` pairs pad the last group and are skipped.
pub fn dtcs_from_bytes(bytes: &[u8]) -> Vec<DtcCode> {
    bytes
        .chunks_exact(2)
        .filter(|pair| pair[0] != 0 || pair[1] != 0)
        .map(|pair| DtcCode::from_bytes(pair[0], pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_p0104() {
        assert_eq!(decode_dtc(0x01, 0x04), "P0104");
    }

    #[test]
    fn test_encode_p0104() {
        assert_eq!(encode_dtc("P0104").unwrap(), [0x01, 0x04]);
        let bytes = encode_dtc("P0104").unwrap();
        assert_eq!(decode_dtc(bytes[0], bytes[1]), "P0104");
    }

    #[test]
    fn test_categories() {
        assert_eq!(decode_dtc(0x80, 0x03), "B0003");
        assert_eq!(decode_dtc(0x41, 0x23), "C0123");
        assert_eq!(decode_dtc(0xD2, 0x9A), "U129A");
        assert_eq!(decode_dtc(0x3F, 0xFF), "P3FFF");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(!DtcCode::is_valid("X0104"));
        assert!(!DtcCode::is_valid("P01"));
        assert!(!DtcCode::is_valid("P4104"));
        assert!(!DtcCode::is_valid("p0104"));
        assert!(!DtcCode::is_valid("P01G4"));
        assert!(!DtcCode::is_valid("P01044"));
        assert!(matches!(encode_dtc("X0104"), Err(ObdError::InvalidDtc(_))));
        assert!(matches!(encode_dtc("P01"), Err(ObdError::InvalidDtc(_))));
    }

    #[test]
    fn test_dtcs_from_bytes_skips_padding() {
        let codes = dtcs_from_bytes(&[0x01, 0x04, 0x80, 0x03, 0x00, 0x00]);
        let names: Vec<String> = codes.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["P0104", "B0003"]);
    }

    proptest! {
        #[test]
        fn prop_bytes_roundtrip(a in any::<u8>(), b in any::<u8>()) {
            let code = DtcCode::from_bytes(a, b);
            prop_assert_eq!(code.to_bytes(), [a, b]);
        }

        #[test]
        fn prop_string_roundtrip(code in "[PCBU][0-3][0-9A-F]{3}") {
            let bytes = encode_dtc(&code).unwrap();
            prop_assert_eq!(decode_dtc(bytes[0], bytes[1]), code);
        }
    }
}
