//! Adapter reports: supported PIDs and stored trouble codes

use crate::error::LoggerError;
use obd_protocol::{discover, CapabilityBitmap, CmdDescriptor, ObdClient, PidCatalog, Transport};
use tracing::{info, warn};

/// One line per supported PID: `0C: [rpm] Engine RPM`
pub fn format_capabilities(caps: &CapabilityBitmap) -> Vec<String> {
    caps.iter()
        .map(|pid| match PidCatalog::lookup_by_pid(pid) {
            Some(cmd) => format!(
                "{:02X}: [{}] {}",
                pid,
                cmd.column_name.unwrap_or("unknown"),
                cmd.human_name
            ),
            None => format!("{:02X}: [unknown] Unknown PID", pid),
        })
        .collect()
}

/// Everything the vehicle supports, one formatted line each
pub async fn capability_report<T: Transport>(client: &mut ObdClient<T>) -> Vec<String> {
    let caps = discover(client, None).await;
    info!("Vehicle reports {} supported PIDs", caps.len());
    format_capabilities(&caps)
}

/// Stored trouble codes as printable lines, MIL state first
pub async fn error_code_report<T: Transport>(
    client: &mut ObdClient<T>,
) -> Result<Vec<String>, LoggerError> {
    let codes = client.read_error_codes().await?;
    let mut lines = vec![format!(
        "{} trouble codes set [MIL is {}]",
        codes.reported,
        if codes.mil_on { "on" } else { "off" }
    )];
    lines.extend(codes.codes.iter().map(|code| format!("Error: {}", code)));
    Ok(lines)
}

/// Narrow `wanted` to what the vehicle supports. An empty discovery result
/// means capabilities are unknown, in which case everything is kept.
pub async fn supported_columns<T: Transport>(
    client: &mut ObdClient<T>,
    wanted: &[&'static CmdDescriptor],
) -> Vec<&'static CmdDescriptor> {
    let wishlist: Vec<u8> = wanted.iter().map(|c| c.pid).collect();
    let caps = discover(client, Some(&wishlist)).await;
    if caps.is_empty() {
        warn!("Could not determine supported PIDs, logging every requested column");
        return wanted.to_vec();
    }

    let (kept, dropped): (Vec<&'static CmdDescriptor>, Vec<&'static CmdDescriptor>) = wanted.iter().copied().partition(|c| caps.contains(c.pid));
    for cmd in &dropped {
        warn!(
            "{} ({:02X}) not supported by this vehicle, not logging it",
            cmd.column_name.unwrap_or("?"),
            cmd.pid
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{BaudSetting, StreamTransport};
    use obd_sim::{
        AdapterIdentity, Ecu, EcuSet, ErrorSource, Reading, ResponderEngine, SimSettings,
        StreamPort, ValueSource,
    };
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Supports coolant temperature and rpm only
    struct TwoPids;

    impl ValueSource for TwoPids {
        fn name(&self) -> &'static str {
            "TwoPids"
        }

        fn get_value(&mut self, _mode: u8, pid: u8) -> Reading {
            match pid {
                // bits for 0x05 and 0x0C
                0x00 => Reading::Data(vec![0x08, 0x10, 0x00, 0x00]),
                0x05 => Reading::Data(vec![0x82]),
                0x0C => Reading::Data(vec![0x1A, 0x00]),
                _ => Reading::none(),
            }
        }
    }

    async fn open_client(source: Box<dyn ValueSource>) -> ObdClient<StreamTransport<DuplexStream>> {
        let (client, server) = tokio::io::duplex(4096);
        let ecus = EcuSet::new(vec![Ecu::new(0, Duration::ZERO, source)]).unwrap();
        let identity = AdapterIdentity {
            version: "ELM327 v1.3a Test".into(),
            device: "Test".into(),
        };
        let mut responder = ResponderEngine::new(
            StreamPort::new(server, "duplex"),
            ecus,
            SimSettings::default(),
            identity,
        );
        tokio::spawn(async move { responder.run().await });

        let mut client = ObdClient::new(StreamTransport::new(client));
        client.open(BaudSetting::Keep, BaudSetting::Keep).await.unwrap();
        client
    }

    #[test]
    fn test_format_capabilities() {
        let caps: CapabilityBitmap = [0x00, 0x0C, 0x01].into_iter().collect();
        let lines = format_capabilities(&caps);
        assert_eq!(lines[0], "00: [unknown] PIDs supported 01-20");
        assert_eq!(lines[2], "0C: [rpm] Engine RPM");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_report() {
        let mut client = open_client(Box::new(TwoPids)).await;
        let lines = capability_report(&mut client).await;
        assert_eq!(
            lines,
            vec![
                "05: [temp] Engine Coolant Temperature",
                "0C: [rpm] Engine RPM"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_supported_columns() {
        let mut client = open_client(Box::new(TwoPids)).await;
        let wanted = PidCatalog::parse_columns("temp,rpm,vss").unwrap();
        let kept = supported_columns(&mut client, &wanted).await;
        let names: Vec<_> = kept.iter().filter_map(|c| c.column_name).collect();
        assert_eq!(names, vec!["temp", "rpm"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_code_report() {
        let mut client = open_client(Box::new(ErrorSource::new())).await;
        let lines = error_code_report(&mut client).await.unwrap();
        assert_eq!(
            lines,
            vec![
                "3 trouble codes set [MIL is on]",
                "Error: P0104",
                "Error: B0003",
                "Error: C0123",
            ]
        );
    }
}
