//! OBD-II PID Catalog
//!
//! Static table of the mode 01 Parameter IDs: names, widths, value ranges
//! and the reversible conversion between reply bytes and engineering units.

use crate::error::ObdError;

/// Linear conversion `value = raw * scale + offset`, where `raw` is the
/// big-endian integer formed by the first `raw_bytes` data bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion {
    pub raw_bytes: u8,
    pub scale: f64,
    pub offset: f64,
}

impl Conversion {
    fn raw_max(&self) -> u32 {
        (1u32 << (8 * u32::from(self.raw_bytes))) - 1
    }

    /// Bytes to engineering value
    pub fn to_value(&self, bytes: &[u8]) -> f64 {
        let raw = bytes
            .iter()
            .take(usize::from(self.raw_bytes))
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        f64::from(raw) * self.scale + self.offset
    }

    /// Engineering value to bytes, rounded to the nearest step and clamped
    /// to what the bytes can carry. Output is padded with zeros to `width`.
    pub fn from_value(&self, value: f64, width: usize) -> Vec<u8> {
        let raw = ((value - self.offset) / self.scale)
            .round()
            .clamp(0.0, f64::from(self.raw_max())) as u32;
        let n = usize::from(self.raw_bytes);
        let mut out = raw.to_be_bytes()[4 - n..].to_vec();
        out.resize(width.max(n), 0);
        out
    }

    /// Smallest and largest representable values
    pub fn range(&self) -> (f64, f64) {
        (self.offset, f64::from(self.raw_max()) * self.scale + self.offset)
    }
}

/// One catalog entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CmdDescriptor {
    pub pid: u8,
    /// Data bytes a reply carries (also the byte-count hint)
    pub expected_bytes: u8,
    /// Storage column, `None` for entries that are never logged
    pub column_name: Option<&'static str>,
    pub human_name: &'static str,
    pub min: f64,
    pub max: f64,
    pub units: &'static str,
    pub conversion: Option<Conversion>,
}

impl CmdDescriptor {
    /// Convert reply bytes. Without a conversion the bytes are
    /// accumulated big-endian.
    pub fn to_value(&self, bytes: &[u8]) -> f64 {
        match &self.conversion {
            Some(conv) => conv.to_value(bytes),
            None => bytes.iter().fold(0.0, |acc, b| acc * 256.0 + f64::from(*b)),
        }
    }

    /// Reverse conversion, `None` for bit-encoded entries
    pub fn from_value(&self, value: f64) -> Option<Vec<u8>> {
        self.conversion
            .map(|conv| conv.from_value(value, usize::from(self.expected_bytes)))
    }
}

macro_rules! cmd {
    ($pid:expr, $bytes:expr, $col:expr, $name:expr, $min:expr, $max:expr, $units:expr) => {
        CmdDescriptor {
            pid: $pid,
            expected_bytes: $bytes,
            column_name: $col,
            human_name: $name,
            min: $min,
            max: $max,
            units: $units,
            conversion: None,
        }
    };
    ($pid:expr, $bytes:expr, $col:expr, $name:expr, $min:expr, $max:expr, $units:expr,
     raw $raw:expr, scale $scale:expr, offset $offset:expr) => {
        CmdDescriptor {
            pid: $pid,
            expected_bytes: $bytes,
            column_name: $col,
            human_name: $name,
            min: $min,
            max: $max,
            units: $units,
            conversion: Some(Conversion {
                raw_bytes: $raw,
                scale: $scale,
                offset: $offset,
            }),
        }
    };
}

const PCT: f64 = 100.0 / 255.0;
const LAMBDA: f64 = 0.0000305;

static MODE1_COMMANDS: [CmdDescriptor; 0x53] = [
    cmd!(0x00, 4, None, "PIDs supported 01-20", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x01, 4, Some("dtc_cnt"), "Monitor status since DTCs cleared", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x02, 2, Some("dtcfrzf"), "DTC that caused required freeze frame data storage", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x03, 2, Some("fuelsys"), "Fuel system 1 and 2 status", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x04, 1, Some("load_pct"), "Calculated LOAD Value", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x05, 1, Some("temp"), "Engine Coolant Temperature", -40.0, 215.0, "Celsius", raw 1, scale 1.0, offset -40.0),
    cmd!(0x06, 1, Some("shrtft13"), "Short Term Fuel Trim - Bank 1,3", -100.0, 99.22, "%", raw 1, scale 100.0 / 128.0, offset -100.0),
    cmd!(0x07, 1, Some("longft13"), "Long Term Fuel Trim - Bank 1,3", -100.0, 99.22, "%", raw 1, scale 100.0 / 128.0, offset -100.0),
    cmd!(0x08, 1, Some("shrtft24"), "Short Term Fuel Trim - Bank 2,4", -100.0, 99.22, "%", raw 1, scale 100.0 / 128.0, offset -100.0),
    cmd!(0x09, 1, Some("longft24"), "Long Term Fuel Trim - Bank 2,4", -100.0, 99.22, "%", raw 1, scale 100.0 / 128.0, offset -100.0),
    cmd!(0x0A, 1, Some("frp"), "Fuel Rail Pressure (gauge)", 0.0, 765.0, "kPa", raw 1, scale 3.0, offset 0.0),
    cmd!(0x0B, 1, Some("map"), "Intake Manifold Absolute Pressure", 0.0, 255.0, "kPa", raw 1, scale 1.0, offset 0.0),
    cmd!(0x0C, 2, Some("rpm"), "Engine RPM", 0.0, 16383.75, "rev/min", raw 2, scale 0.25, offset 0.0),
    cmd!(0x0D, 1, Some("vss"), "Vehicle Speed Sensor", 0.0, 255.0, "km/h", raw 1, scale 1.0, offset 0.0),
    cmd!(0x0E, 1, Some("sparkadv"), "Ignition Timing Advance for #1 Cylinder", -64.0, 63.5, "degrees relative to #1 cylinder", raw 1, scale 0.5, offset -64.0),
    cmd!(0x0F, 1, Some("iat"), "Intake Air Temperature", -40.0, 215.0, "Celsius", raw 1, scale 1.0, offset -40.0),
    cmd!(0x10, 2, Some("maf"), "Air Flow Rate from Mass Air Flow Sensor", 0.0, 655.35, "g/s", raw 2, scale 0.01, offset 0.0),
    cmd!(0x11, 1, Some("throttlepos"), "Absolute Throttle Position", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x12, 1, Some("air_stat"), "Commanded Secondary Air Status", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x13, 1, Some("o2sloc"), "Location of Oxygen Sensors", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x14, 2, Some("o2s11"), "Bank 1 - Sensor 1 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x15, 2, Some("o2s12"), "Bank 1 - Sensor 2 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x16, 2, Some("o2s13"), "Bank 1 - Sensor 3 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x17, 2, Some("o2s14"), "Bank 1 - Sensor 4 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x18, 2, Some("o2s21"), "Bank 2 - Sensor 1 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x19, 2, Some("o2s22"), "Bank 2 - Sensor 2 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x1A, 2, Some("o2s23"), "Bank 2 - Sensor 3 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x1B, 2, Some("o2s24"), "Bank 2 - Sensor 4 Oxygen Sensor Output Voltage", 0.0, 1.275, "V", raw 1, scale 0.005, offset 0.0),
    cmd!(0x1C, 1, Some("obdsup"), "OBD requirements to which vehicle is designed", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x1D, 1, Some("o2sloc2"), "Location of oxygen sensors", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x1E, 1, Some("pto_stat"), "Auxiliary Input Status", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x1F, 2, Some("runtm"), "Time Since Engine Start", 0.0, 65535.0, "seconds", raw 2, scale 1.0, offset 0.0),
    cmd!(0x20, 4, None, "PIDs supported 21-40", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x21, 2, Some("mil_dist"), "Distance Travelled While MIL is Activated", 0.0, 65535.0, "km", raw 2, scale 1.0, offset 0.0),
    cmd!(0x22, 2, Some("frpm"), "Fuel Rail Pressure relative to manifold vacuum", 0.0, 5177.265, "kPa", raw 2, scale 0.079, offset 0.0),
    cmd!(0x23, 2, Some("frpd"), "Fuel Rail Pressure (diesel)", 0.0, 655350.0, "kPa", raw 2, scale 10.0, offset 0.0),
    cmd!(0x24, 4, Some("lambda11"), "Bank 1 - Sensor 1 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x25, 4, Some("lambda12"), "Bank 1 - Sensor 2 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x26, 4, Some("lambda13"), "Bank 1 - Sensor 3 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x27, 4, Some("lambda14"), "Bank 1 - Sensor 4 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x28, 4, Some("lambda21"), "Bank 2 - Sensor 1 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x29, 4, Some("lambda22"), "Bank 2 - Sensor 2 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x2A, 4, Some("lambda23"), "Bank 2 - Sensor 3 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x2B, 4, Some("lambda24"), "Bank 2 - Sensor 4 Equivalence Ratio (lambda) / Voltage", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x2C, 1, Some("egr_pct"), "Commanded EGR", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x2D, 1, Some("egr_err"), "EGR Error", -100.0, 99.22, "%", raw 1, scale 0.78125, offset -100.0),
    cmd!(0x2E, 1, Some("evap_pct"), "Commanded Evaporative Purge", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x2F, 1, Some("fli"), "Fuel Level Input", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x30, 1, Some("warm_ups"), "Number of warm-ups since diagnostic trouble codes cleared", 0.0, 255.0, "", raw 1, scale 1.0, offset 0.0),
    cmd!(0x31, 2, Some("clr_dist"), "Distance since diagnostic trouble codes cleared", 0.0, 65535.0, "km", raw 2, scale 1.0, offset 0.0),
    cmd!(0x32, 2, Some("evap_vp"), "Evap System Vapour Pressure", -8192.0, 8191.75, "Pa", raw 2, scale 0.25, offset -8192.0),
    cmd!(0x33, 1, Some("baro"), "Barometric Pressure", 0.0, 255.0, "kPa", raw 1, scale 1.0, offset 0.0),
    cmd!(0x34, 4, Some("lambdac11"), "Bank 1 - Sensor 1 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x35, 4, Some("lambdac12"), "Bank 1 - Sensor 2 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x36, 4, Some("lambdac13"), "Bank 1 - Sensor 3 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x37, 4, Some("lambdac14"), "Bank 1 - Sensor 4 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x38, 4, Some("lambdac21"), "Bank 2 - Sensor 1 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x39, 4, Some("lambdac22"), "Bank 2 - Sensor 2 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x3A, 4, Some("lambdac23"), "Bank 2 - Sensor 3 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x3B, 4, Some("lambdac24"), "Bank 2 - Sensor 4 Equivalence Ratio (lambda) / Current", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x3C, 2, Some("catemp11"), "Catalyst Temperature Bank 1 / Sensor 1", -40.0, 6513.5, "Celsius", raw 2, scale 0.1, offset -40.0),
    cmd!(0x3D, 2, Some("catemp21"), "Catalyst Temperature Bank 2 / Sensor 1", -40.0, 6513.5, "Celsius", raw 2, scale 0.1, offset -40.0),
    cmd!(0x3E, 2, Some("catemp12"), "Catalyst Temperature Bank 1 / Sensor 2", -40.0, 6513.5, "Celsius", raw 2, scale 0.1, offset -40.0),
    cmd!(0x3F, 2, Some("catemp22"), "Catalyst Temperature Bank 2 / Sensor 2", -40.0, 6513.5, "Celsius", raw 2, scale 0.1, offset -40.0),
    cmd!(0x40, 4, None, "PIDs supported 41-60", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x41, 4, None, "Monitor status this driving cycle", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x42, 2, Some("vpwr"), "Control module voltage", 0.0, 65.535, "V", raw 2, scale 0.001, offset 0.0),
    cmd!(0x43, 2, Some("load_abs"), "Absolute Load Value", 0.0, 25700.0, "%", raw 2, scale PCT, offset 0.0),
    cmd!(0x44, 2, Some("lambda"), "Fuel/air Commanded Equivalence Ratio", 0.0, 1.999, "(ratio)", raw 2, scale LAMBDA, offset 0.0),
    cmd!(0x45, 1, Some("tp_r"), "Relative Throttle Position", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x46, 1, Some("aat"), "Ambient air temperature", -40.0, 215.0, "Celsius", raw 1, scale 1.0, offset -40.0),
    cmd!(0x47, 1, Some("tp_b"), "Absolute Throttle Position B", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x48, 1, Some("tp_c"), "Absolute Throttle Position C", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x49, 1, Some("app_d"), "Accelerator Pedal Position D", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x4A, 1, Some("app_e"), "Accelerator Pedal Position E", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x4B, 1, Some("app_f"), "Accelerator Pedal Position F", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x4C, 1, Some("tac_pct"), "Commanded Throttle Actuator Control", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
    cmd!(0x4D, 2, Some("mil_time"), "Time run by the engine while MIL activated", 0.0, 65535.0, "minutes", raw 2, scale 1.0, offset 0.0),
    cmd!(0x4E, 2, Some("clr_time"), "Time since diagnostic trouble codes cleared", 0.0, 65535.0, "minutes", raw 2, scale 1.0, offset 0.0),
    cmd!(0x4F, 4, None, "External Test Equipment Configuration #1", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x50, 4, None, "External Test Equipment Configuration #2", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x51, 1, Some("fuel_type"), "Fuel Type", 0.0, 0.0, "Bit Encoded"),
    cmd!(0x52, 1, Some("alch_pct"), "Ethanol fuel %", 0.0, 100.0, "%", raw 1, scale PCT, offset 0.0),
];

/// Lookup service over the mode 01 table
pub struct PidCatalog;

impl PidCatalog {
    /// Every known entry, ordered by PID
    pub fn entries() -> &'static [CmdDescriptor] {
        &MODE1_COMMANDS
    }

    /// Find an entry by PID
    pub fn lookup_by_pid(pid: u8) -> Option<&'static CmdDescriptor> {
        MODE1_COMMANDS.get(usize::from(pid))
    }

    /// Find an entry by storage column name
    pub fn lookup_by_column(column: &str) -> Option<&'static CmdDescriptor> {
        MODE1_COMMANDS
            .iter()
            .find(|cmd| cmd.column_name == Some(column))
    }

    /// Resolve a comma separated column list. Unknown names are an error.
    pub fn parse_columns(list: &str) -> Result<Vec<&'static CmdDescriptor>, ObdError> {
        let mut cmds: Vec<&'static CmdDescriptor> = Vec::new();
        for name in list.split(|c: char| c == ',' || c.is_whitespace()).filter(|s| !s.is_empty()) {
            let cmd = Self::lookup_by_column(name)
                .ok_or_else(|| ObdError::UnknownColumn(name.to_string()))?;
            if !cmds.iter().any(|c| c.pid == cmd.pid) {
                cmds.push(cmd);
            }
        }
        Ok(cmds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_table_indexed_by_pid() {
        for (i, cmd) in PidCatalog::entries().iter().enumerate() {
            assert_eq!(usize::from(cmd.pid), i);
        }
    }

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = 1674.75
        let rpm = PidCatalog::lookup_by_pid(0x0C).unwrap();
        assert!((rpm.to_value(&[0x1A, 0x2B]) - 1674.75).abs() < 0.01);
        assert!((rpm.to_value(&[0x1A, 0x00]) - 1664.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_coolant_temp_decode() {
        let temp = PidCatalog::lookup_by_column("temp").unwrap();
        assert_eq!(temp.pid, 0x05);
        assert!((temp.to_value(&[0x73]) - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_decode() {
        let trim = PidCatalog::lookup_by_pid(0x06).unwrap();
        assert!((trim.to_value(&[0x80]) - 0.0).abs() < 0.01);
        assert!((trim.to_value(&[0x90]) - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_bit_encoded_accumulates() {
        let status = PidCatalog::lookup_by_pid(0x01).unwrap();
        assert_eq!(status.to_value(&[0x83, 0x00, 0x00, 0x01]), 2_197_815_297.0);
        assert!(status.from_value(1.0).is_none());
    }

    #[test]
    fn test_reverse_pads_declared_width() {
        let o2 = PidCatalog::lookup_by_pid(0x14).unwrap();
        assert_eq!(o2.from_value(0.5).unwrap(), vec![100, 0]);
        let rpm = PidCatalog::lookup_by_pid(0x0C).unwrap();
        assert_eq!(rpm.from_value(1664.0).unwrap(), vec![0x1A, 0x00]);
    }

    #[test]
    fn test_parse_columns() {
        let cmds = PidCatalog::parse_columns("temp,rpm,vss,rpm").unwrap();
        let pids: Vec<u8> = cmds.iter().map(|c| c.pid).collect();
        assert_eq!(pids, vec![0x05, 0x0C, 0x0D]);
        assert!(matches!(
            PidCatalog::parse_columns("temp,warp_factor"),
            Err(ObdError::UnknownColumn(name)) if name == "warp_factor"
        ));
    }

    fn convertible() -> Vec<&'static CmdDescriptor> {
        PidCatalog::entries()
            .iter()
            .filter(|c| c.conversion.is_some())
            .collect()
    }

    proptest! {
        #[test]
        fn prop_value_roundtrip(index in 0usize..1000, fraction in 0.0f64..=1.0) {
            let cmds = convertible();
            let cmd = cmds[index % cmds.len()];
            let conv = cmd.conversion.unwrap();
            let (lo, hi) = conv.range();
            let lo = lo.max(cmd.min);
            let hi = hi.min(cmd.max);
            let x = lo + fraction * (hi - lo);

            let bytes = cmd.from_value(x).unwrap();
            prop_assert_eq!(bytes.len(), usize::from(cmd.expected_bytes));
            let back = cmd.to_value(&bytes);
            prop_assert!((back - x).abs() <= conv.scale / 2.0 + 1e-9,
                "pid {:02X}: {} -> {:?} -> {}", cmd.pid, x, bytes, back);
        }
    }
}
