//! OBD-II Client for ELM327 Adapters
//!
//! Drives the adapter through reset, line-speed negotiation and setup, then
//! issues one request at a time and decodes the reply.

use crate::codec::{decode_response, encode_command, is_reply_complete, ObdReply, ObdRequest};
use crate::dtc::{dtcs_from_bytes, DtcCode};
use crate::error::{ObdError, ObdStatus};
use crate::pid::PidCatalog;
use crate::seriallog::{Direction, SerialLog};
use crate::transport::Transport;
use crate::mode;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default time to wait for a complete reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Rates tried, in order, when the adapter's speed is unknown
pub const GUESS_BAUD_RATES: [u32; 6] = [9600, 38400, 115200, 57600, 2400, 1200];

/// Rates tried, in order, when upgrading to the fastest speed that works
pub const UPGRADE_BAUD_RATES: [u32; 7] = [38400, 57600, 115200, 230400, 460800, 500000, 576000];

/// Adapter clock the `ATBRD` divisor is taken from
const BRD_CLOCK: u32 = 4_000_000;

/// How long the adapter waits for us to confirm a new rate
const UPGRADE_WINDOW: Duration = Duration::from_millis(500);

/// Window for a canary reply while guessing the rate
const GUESS_WINDOW: Duration = Duration::from_secs(1);

/// Commands that normalise adapter output after reset
const INIT_COMMANDS: [&str; 5] = ["0100", "ATE0", "ATL0", "ATS0", "0100"];

const READ_CHUNK: usize = 256;
const MAX_REPLY_BYTES: usize = 4096;

/// Requested local line speed handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudSetting {
    /// Leave the line as opened
    Keep,
    /// Probe standard rates until the adapter answers
    Guess,
    /// Use this rate
    Rate(u32),
}

impl BaudSetting {
    /// `-1` keeps the current rate, `0` guesses, anything positive is a rate
    pub fn from_config(value: i64) -> Self {
        match value {
            0 => BaudSetting::Guess,
            v if v > 0 => u32::try_from(v).map_or(BaudSetting::Keep, BaudSetting::Rate),
            _ => BaudSetting::Keep,
        }
    }
}

/// Lifecycle of a requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    Closed,
    Opening,
    BaudGuess,
    BaudUpgrade,
    Initializing,
    Ready,
}

impl RequesterState {
    fn as_str(&self) -> &'static str {
        match self {
            RequesterState::Closed => "closed",
            RequesterState::Opening => "opening",
            RequesterState::BaudGuess => "guessing baud rate",
            RequesterState::BaudUpgrade => "upgrading baud rate",
            RequesterState::Initializing => "initializing",
            RequesterState::Ready => "ready",
        }
    }
}

impl fmt::Display for RequesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored trouble codes and lamp state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorCodes {
    pub mil_on: bool,
    /// Count the ECU reported, which may exceed `codes.len()`
    pub reported: u8,
    pub codes: Vec<DtcCode>,
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient<T: Transport> {
    transport: T,
    state: RequesterState,
    timeout: Duration,
    serial_log: Option<SerialLog>,
}

impl<T: Transport> ObdClient<T> {
    /// Wrap a transport. Call [`ObdClient::open`] before querying.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: RequesterState::Closed,
            timeout: DEFAULT_TIMEOUT,
            serial_log: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Trace every line exchanged with the adapter
    pub fn with_serial_log(mut self, log: SerialLog) -> Self {
        self.serial_log = Some(log);
        self
    }

    pub fn state(&self) -> RequesterState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == RequesterState::Ready
    }

    /// Reset the adapter, negotiate the line speed and normalise output.
    ///
    /// Speed negotiation failures are logged and the session continues at
    /// whatever rate is in effect.
    pub async fn open(&mut self, baud: BaudSetting, upgrade: BaudSetting) -> Result<(), ObdError> {
        self.state = RequesterState::Opening;
        info!("Resetting adapter");
        self.blind_command("ATZ").await?;

        match baud {
            BaudSetting::Keep => {}
            BaudSetting::Guess => {
                self.state = RequesterState::BaudGuess;
                if let Err(e) = self.guess_baud_rate().await {
                    warn!("{}. Continuing, but may suffer issues", e);
                }
            }
            BaudSetting::Rate(rate) => self.transport.set_baud_rate(rate).await?,
        }

        if upgrade != BaudSetting::Keep {
            self.state = RequesterState::BaudUpgrade;
            if let Err(e) = self.upgrade_baud_rate(upgrade).await {
                warn!("{}. Continuing, but may suffer issues", e);
            }
        }

        self.state = RequesterState::Initializing;
        for cmd in INIT_COMMANDS {
            self.blind_command(cmd).await?;
        }

        self.state = RequesterState::Ready;
        info!("Adapter initialized");
        Ok(())
    }

    /// Probe [`GUESS_BAUD_RATES`] with a canary request; the first rate
    /// that yields a prompt wins.
    pub async fn guess_baud_rate(&mut self) -> Result<u32, ObdError> {
        for rate in GUESS_BAUD_RATES {
            debug!("Trying {} baud", rate);
            self.transport.set_baud_rate(rate).await?;
            self.write_line(&encode_command("0100")).await?;
            match self.read_until(|s| s.contains('>'), GUESS_WINDOW).await {
                Ok(_) => {
                    info!("Adapter answered at {} baud", rate);
                    return Ok(rate);
                }
                Err(ObdError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ObdError::BaudRate("no standard rate answered".to_string()))
    }

    /// Switch adapter and local port to a faster rate.
    ///
    /// `Rate` attempts exactly that rate; `Guess` walks
    /// [`UPGRADE_BAUD_RATES`] and ends on the fastest one that worked.
    pub async fn upgrade_baud_rate(&mut self, target: BaudSetting) -> Result<u32, ObdError> {
        let start = self.transport.baud_rate().unwrap_or(GUESS_BAUD_RATES[0]);
        match target {
            BaudSetting::Keep => Ok(start),
            BaudSetting::Rate(rate) => {
                self.attempt_upgrade(rate, start).await?;
                Ok(rate)
            }
            BaudSetting::Guess => {
                let mut best = None;
                for rate in UPGRADE_BAUD_RATES {
                    let previous = best.unwrap_or(start);
                    match self.attempt_upgrade(rate, previous).await {
                        Ok(()) => best = Some(rate),
                        Err(e) => debug!("{}", e),
                    }
                }
                best.ok_or_else(|| ObdError::BaudRate("no faster rate accepted".to_string()))
            }
        }
    }

    async fn attempt_upgrade(&mut self, rate: u32, previous: u32) -> Result<(), ObdError> {
        let divisor = BRD_CLOCK.checked_div(rate).unwrap_or(0);
        if !(1..=0xFF).contains(&divisor) {
            return Err(ObdError::BaudRate(format!("{} baud has no divisor", rate)));
        }

        let brt = UPGRADE_WINDOW.as_millis() / 5;
        self.blind_command(&format!("ATBRT{:02X}", brt)).await?;

        self.write_line(&encode_command(&format!("ATBRD{:02X}", divisor)))
            .await?;
        let answer = self
            .read_until(|s| s.contains("OK") || s.contains('?'), self.timeout)
            .await
            .unwrap_or_default();
        if !answer.contains("OK") {
            return Err(ObdError::BaudRate(format!("adapter refused {} baud", rate)));
        }

        self.transport.set_baud_rate(rate).await?;
        let mut banner = answer
            .split_once("OK")
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        if !banner.contains("ELM") {
            banner = self
                .read_until(|s| s.contains("ELM") || s.contains('>'), UPGRADE_WINDOW * 2)
                .await
                .unwrap_or_default();
        }
        if banner.contains("ELM") {
            self.write_line("\r").await?;
            let _ = self.read_until(|s| s.contains('>'), UPGRADE_WINDOW).await;
            info!("Baud rate upgraded to {}", rate);
            Ok(())
        } else {
            self.transport.set_baud_rate(previous).await?;
            Err(ObdError::BaudRate(format!("no banner at {} baud", rate)))
        }
    }

    /// Send one request and decode the reply.
    ///
    /// Transport failures and empty timeouts come back as
    /// [`ObdStatus::Error`]; they are never fatal to the client.
    pub async fn query(&mut self, mode: u8, pid: u8, hint_bytes: Option<u8>) -> ObdReply {
        if !self.is_ready() {
            warn!("Query {:02X} {:02X} while {}", mode, pid, self.state);
            return ObdReply::failure(ObdStatus::Error);
        }

        let request = ObdRequest::new(mode, pid).with_hint(hint_bytes);
        let raw = match self.exchange(&request.encode()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Query {:02X} {:02X} failed: {}", mode, pid, e);
                return ObdReply::failure(ObdStatus::Error);
            }
        };

        let reply = decode_response(&raw, mode, pid);
        if !reply.is_success() {
            debug!("Query {:02X} {:02X}: {} ({:?})", mode, pid, reply.status, raw.trim());
        }
        reply
    }

    /// Query a mode 01 PID and convert the reply to engineering units
    pub async fn get_numeric_value(&mut self, pid: u8, hint: bool) -> Result<f64, ObdError> {
        let cmd = PidCatalog::lookup_by_pid(pid);
        let hint_bytes = if hint { cmd.map(|c| c.expected_bytes) } else { None };
        let bytes = self
            .query(mode::CURRENT_DATA, pid, hint_bytes)
            .await
            .into_result()?;
        Ok(match cmd {
            Some(cmd) => cmd.to_value(&bytes),
            None => bytes.iter().fold(0.0, |acc, b| acc * 256.0 + f64::from(*b)),
        })
    }

    /// Read the stored trouble codes and MIL state
    pub async fn read_error_codes(&mut self) -> Result<ErrorCodes, ObdError> {
        let status = self
            .query(mode::CURRENT_DATA, 0x01, None)
            .await
            .into_result()?;
        let a = status.first().copied().unwrap_or(0);
        let mut result = ErrorCodes {
            mil_on: a & 0x80 != 0,
            reported: a & 0x7F,
            codes: Vec::new(),
        };
        info!(
            "{} trouble codes set [MIL is {}]",
            result.reported,
            if result.mil_on { "on" } else { "off" }
        );

        if result.reported > 0 {
            let bytes = self.query(mode::READ_DTC, 0x00, None).await.into_result()?;
            result.codes = dtcs_from_bytes(&bytes);
        }
        Ok(result)
    }

    /// Ask every ECU to clear its trouble codes
    pub async fn clear_error_codes(&mut self) -> Result<(), ObdError> {
        if !self.is_ready() {
            return Err(ObdError::NotReady(self.state.as_str()));
        }
        let raw = self
            .exchange(&ObdRequest::new(mode::CLEAR_DTC, 0x00).encode())
            .await?;
        if raw.contains("OK") || decode_response(&raw, mode::CLEAR_DTC, 0x00).is_success() {
            Ok(())
        } else {
            Err(ObdError::Status(ObdStatus::Unparsable))
        }
    }

    /// Send a raw command (`ATI`, `ATRV`, ...) and return the reply text
    /// without echo or prompt.
    pub async fn send_command(&mut self, cmd: &str) -> Result<String, ObdError> {
        if !self.is_ready() {
            return Err(ObdError::NotReady(self.state.as_str()));
        }
        let raw = self.exchange(&encode_command(cmd)).await?;
        let lines: Vec<&str> = raw
            .split(|c: char| c == '\r' || c == '\n' || c == '>')
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case(cmd))
            .collect();
        Ok(lines.join("\n"))
    }

    /// Reset the adapter without waiting for it, then release the transport
    pub async fn close(&mut self) -> Result<(), ObdError> {
        if self.state == RequesterState::Closed {
            return Ok(());
        }
        info!("Closing adapter");
        let result = self.write_line(&encode_command("ATZ")).await;
        self.state = RequesterState::Closed;
        self.transport.close().await?;
        result
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send a command and discard everything up to the next prompt
    async fn blind_command(&mut self, cmd: &str) -> Result<(), ObdError> {
        match self.exchange(&encode_command(cmd)).await {
            Ok(_) | Err(ObdError::Timeout(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exchange(&mut self, line: &str) -> Result<String, ObdError> {
        self.write_line(line).await?;
        self.read_until(|s| is_reply_complete(s.as_bytes()), self.timeout)
            .await
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ObdError> {
        if let Some(log) = self.serial_log.as_mut() {
            log.record(Direction::Out, line);
        }
        self.transport.send(line.as_bytes()).await
    }

    /// Read until `done` accepts the accumulated text, the peer closes, or
    /// `timeout` passes. Nothing read at all is a timeout.
    async fn read_until<F>(&mut self, done: F, timeout: Duration) -> Result<String, ObdError>
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.transport.receive(&mut chunk, deadline - now).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if done(&String::from_utf8_lossy(&buf)) || buf.len() >= MAX_REPLY_BYTES {
                        break;
                    }
                }
                Err(ObdError::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }

        if buf.is_empty() {
            return Err(ObdError::Timeout(timeout.as_millis() as u64));
        }
        let text = String::from_utf8_lossy(&buf).into_owned();
        if let Some(log) = self.serial_log.as_mut() {
            log.record(Direction::In, &text);
        }
        Ok(text)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Adapter stand-in answering each written line from a script
    pub(crate) struct ScriptedTransport {
        replies: VecDeque<(String, String)>,
        pending: VecDeque<u8>,
        pub sent: Vec<String>,
        pub baud: Option<u32>,
        /// Every rate the port was switched to, in order
        pub baud_changes: Vec<u32>,
        pub fallback: Option<String>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                replies: VecDeque::new(),
                pending: VecDeque::new(),
                sent: Vec::new(),
                baud: None,
                baud_changes: Vec::new(),
                fallback: Some("OK\r\r>".to_string()),
            }
        }

        /// Answer the next write of `cmd` (terminator excluded) with `reply`
        pub fn expect(mut self, cmd: &str, reply: &str) -> Self {
            self.replies.push_back((cmd.to_string(), reply.to_string()));
            self
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, data: &[u8]) -> Result<(), ObdError> {
            let line = String::from_utf8_lossy(data).trim_end().to_string();
            self.sent.push(line.clone());
            let reply = match self.replies.front() {
                Some((cmd, _)) if *cmd == line => self.replies.pop_front().map(|(_, r)| r),
                _ => self.fallback.clone(),
            };
            if let Some(reply) = reply {
                self.pending.extend(reply.bytes());
            }
            Ok(())
        }

        async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ObdError> {
            if self.pending.is_empty() {
                tokio::time::sleep(timeout).await;
                return Err(ObdError::Timeout(timeout.as_millis() as u64));
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), ObdError> {
            self.baud = Some(baud_rate);
            self.baud_changes.push(baud_rate);
            Ok(())
        }

        fn baud_rate(&self) -> Option<u32> {
            self.baud
        }

        async fn close(&mut self) -> Result<(), ObdError> {
            Ok(())
        }
    }

    async fn ready_client(transport: ScriptedTransport) -> ObdClient<ScriptedTransport> {
        let mut client = ObdClient::new(transport);
        client.open(BaudSetting::Keep, BaudSetting::Keep).await.unwrap();
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sequence() {
        let client = ready_client(ScriptedTransport::new()).await;
        assert!(client.is_ready());
        let sent = client.into_transport().sent;
        assert_eq!(sent, vec!["ATZ", "0100", "ATE0", "ATL0", "ATS0", "0100"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_rpm() {
        let transport = ScriptedTransport::new().expect("010C", "41 0C 1A 00\r\r>");
        let mut client = ready_client(transport).await;
        let rpm = client.get_numeric_value(0x0C, false).await.unwrap();
        assert_eq!(rpm, 1664.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_hint() {
        let transport = ScriptedTransport::new().expect("010D1", "410D32\r>");
        let mut client = ready_client(transport).await;
        let speed = client.get_numeric_value(0x0D, true).await.unwrap();
        assert_eq!(speed, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_before_open() {
        let mut client = ObdClient::new(ScriptedTransport::new());
        let reply = client.query(0x01, 0x0C, None).await;
        assert_eq!(reply.status, ObdStatus::Error);
        assert!(client.into_transport().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_error() {
        let mut transport = ScriptedTransport::new();
        transport.fallback = None;
        let mut client = ObdClient::new(transport).with_timeout(Duration::from_millis(100));
        client.open(BaudSetting::Keep, BaudSetting::Keep).await.unwrap();
        let reply = client.query(0x01, 0x0C, None).await;
        assert_eq!(reply.status, ObdStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_status() {
        let transport = ScriptedTransport::new().expect("0146", "NO DATA\r\r>");
        let mut client = ready_client(transport).await;
        let err = client.get_numeric_value(0x46, false).await.unwrap_err();
        assert!(matches!(err, ObdError::Status(ObdStatus::NoData)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_codes() {
        let transport = ScriptedTransport::new()
            .expect("0101", "41 01 83 00 00 00\r\r>")
            .expect("03", "43 01 04 80 03 41 23\r\r>");
        let mut client = ready_client(transport).await;
        let codes = client.read_error_codes().await.unwrap();
        assert!(codes.mil_on);
        assert_eq!(codes.reported, 3);
        let names: Vec<String> = codes.codes.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, vec!["P0104", "B0003", "C0123"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_error_codes_skips_mode3() {
        let transport = ScriptedTransport::new().expect("0101", "41 01 00 00 00 00\r\r>");
        let mut client = ready_client(transport).await;
        let codes = client.read_error_codes().await.unwrap();
        assert_eq!(codes, ErrorCodes::default());
        assert!(!client.into_transport().sent.contains(&"03".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_strips_echo() {
        let transport = ScriptedTransport::new().expect("ATI", "ATI\rELM327 v1.3a\r\r>");
        let mut client = ready_client(transport).await;
        assert_eq!(client.send_command("ATI").await.unwrap(), "ELM327 v1.3a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_reset() {
        let mut client = ready_client(ScriptedTransport::new()).await;
        client.close().await.unwrap();
        assert_eq!(client.state(), RequesterState::Closed);
        assert_eq!(client.into_transport().sent.last().map(String::as_str), Some("ATZ"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guess_baud_rate() {
        // Nothing answers until the third probe
        let mut transport = ScriptedTransport::new()
            .expect("0100", "")
            .expect("0100", "")
            .expect("0100", "SEARCHING...\r41 00 BE 1F A8 13\r\r>");
        transport.fallback = None;
        let mut client = ObdClient::new(transport);
        let rate = client.guess_baud_rate().await.unwrap();
        assert_eq!(rate, 115200);
        assert_eq!(client.transport.baud, Some(115200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_success() {
        let transport = ScriptedTransport::new()
            .expect("ATBRT64", "OK\r\r>")
            .expect("ATBRD45", "OK\rELM327 v1.3a")
            .expect("", "\r>");
        let mut client = ObdClient::new(transport);
        let rate = client.upgrade_baud_rate(BaudSetting::Rate(57600)).await.unwrap();
        assert_eq!(rate, 57600);
        assert_eq!(client.transport.baud, Some(57600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_refused_keeps_rate() {
        let mut transport = ScriptedTransport::new()
            .expect("ATBRT64", "OK\r\r>")
            .expect("ATBRD45", "?\r\r>");
        transport.baud = Some(38400);
        let mut client = ObdClient::new(transport);
        assert!(client.upgrade_baud_rate(BaudSetting::Rate(57600)).await.is_err());
        assert_eq!(client.transport.baud, Some(38400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_without_banner_reverts() {
        let mut transport = ScriptedTransport::new()
            .expect("ATBRT64", "OK\r\r>")
            .expect("ATBRD45", "OK\r");
        transport.baud = Some(38400);
        let mut client = ObdClient::new(transport);
        client
            .open(BaudSetting::Keep, BaudSetting::Rate(57600))
            .await
            .unwrap();

        assert!(client.is_ready());
        let transport = client.into_transport();
        assert_eq!(transport.baud_changes, vec![57600, 38400]);
        assert_eq!(transport.baud, Some(38400));
        assert!(!transport.sent.contains(&String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_wrong_banner_reverts() {
        let mut transport = ScriptedTransport::new()
            .expect("ATBRT64", "OK\r\r>")
            .expect("ATBRD45", "OK\rSTN1110\r>");
        transport.baud = Some(38400);
        let mut client = ObdClient::new(transport);
        let err = client
            .upgrade_baud_rate(BaudSetting::Rate(57600))
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::BaudRate(_)));
        assert_eq!(client.transport.baud_changes, vec![57600, 38400]);
    }

    #[test]
    fn test_baud_setting_from_config() {
        assert_eq!(BaudSetting::from_config(-1), BaudSetting::Keep);
        assert_eq!(BaudSetting::from_config(0), BaudSetting::Guess);
        assert_eq!(BaudSetting::from_config(38400), BaudSetting::Rate(38400));
    }
}
