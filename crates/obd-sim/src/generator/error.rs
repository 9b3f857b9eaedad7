//! Fixed set of stored trouble codes with the MIL lit

use super::{ErrorReport, Reading, ValueSource};

const CODES: [[u8; 2]; 3] = [[0x01, 0x04], [0x80, 0x03], [0x41, 0x23]];

#[derive(Debug, Default)]
pub struct ErrorSource {
    cleared: bool,
}

impl ErrorSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueSource for ErrorSource {
    fn name(&self) -> &'static str {
        "Error"
    }

    fn get_value(&mut self, _mode: u8, pid: u8) -> Reading {
        match pid {
            0x00 => Reading::Data(vec![0x80, 0x00, 0x00, 0x00]),
            0x01 if self.cleared => Reading::Data(vec![0x00, 0x00, 0x00, 0x00]),
            0x01 => Reading::Data(vec![0x80 | CODES.len() as u8, 0x00, 0x00, 0x00]),
            _ => Reading::none(),
        }
    }

    fn error_codes(&mut self) -> Option<ErrorReport> {
        if self.cleared {
            return Some(ErrorReport::default());
        }
        Some(ErrorReport {
            codes: CODES.to_vec(),
            mil: true,
        })
    }

    fn clear_error_codes(&mut self) {
        self.cleared = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::DtcCode;

    #[test]
    fn test_reports_three_codes() {
        let mut source = ErrorSource::new();
        assert_eq!(
            source.get_value(1, 0x01),
            Reading::Data(vec![0x83, 0x00, 0x00, 0x00])
        );
        let report = source.error_codes().unwrap();
        assert!(report.mil);
        let names: Vec<String> = report
            .codes
            .iter()
            .map(|c| DtcCode::from_bytes(c[0], c[1]).to_string())
            .collect();
        assert_eq!(names, vec!["P0104", "B0003", "C0123"]);
    }

    #[test]
    fn test_clear() {
        let mut source = ErrorSource::new();
        source.clear_error_codes();
        assert_eq!(
            source.get_value(1, 0x01),
            Reading::Data(vec![0x00, 0x00, 0x00, 0x00])
        );
        assert!(source.error_codes().unwrap().codes.is_empty());
    }
}
