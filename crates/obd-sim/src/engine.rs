//! Responder engine
//!
//! Single owner of the simulated adapter: it reads one command line at a
//! time from a [`SimPort`], runs AT commands against [`SimSettings`] and
//! answers OBD requests from the configured ECUs in delay order. Every
//! reply ends with the prompt.

use crate::at_command::{handle_at_command, AdapterIdentity};
use crate::ecu::{schedule, EcuSet, MAX_FREEZE_FRAMES};
use crate::error::SimError;
use crate::generator::Reading;
use crate::port::SimPort;
use crate::settings::SimSettings;
use obd_protocol::{mode, render_header, scan_request, PidCatalog, PROMPT};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Length of one dispatch loop iteration
pub const TICK: Duration = Duration::from_millis(1);

/// Header length byte used for trouble code and freeze frame lines
const FIXED_REPLY_LEN: u8 = 7;

/// Data bytes one value reply frame can carry behind mode and PID
const MAX_VALUE_BYTES: usize = FIXED_REPLY_LEN as usize - 2;

/// Whether the dispatch loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Throughput counters reported with `--benchmark`
#[derive(Debug)]
struct Benchmark {
    period: Duration,
    started: Instant,
    good: u64,
    total: u64,
}

impl Benchmark {
    fn new(period: Duration) -> Self {
        Self {
            period,
            started: Instant::now(),
            good: 0,
            total: 0,
        }
    }

    fn report_if_due(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed < self.period {
            return;
        }
        let secs = elapsed.as_secs_f64();
        info!(
            "{:.3} seconds. {} samples, {} queries. {:.2} s/s, {:.2} q/s",
            secs,
            self.good,
            self.total,
            self.good as f64 / secs,
            self.total as f64 / secs
        );
        self.started = Instant::now();
        self.good = 0;
        self.total = 0;
    }
}

fn header(settings: &SimSettings, address: u8, payload_len: u8) -> String {
    if !settings.headers {
        return String::new();
    }
    render_header(
        settings.protocol.protocol.header_type(),
        address,
        payload_len,
        settings.spaces,
        settings.dlc,
    )
}

/// One ECU's answer to a current-data request. Data beyond a single
/// frame is dropped.
pub fn format_value_reply(
    settings: &SimSettings,
    address: u8,
    mode: u8,
    pid: u8,
    data: &[u8],
) -> String {
    if data.len() > MAX_VALUE_BYTES {
        warn!(
            "ECU {} reply for {:02X} carries {} bytes, sending {}",
            address,
            pid,
            data.len(),
            MAX_VALUE_BYTES
        );
    }
    let data = &data[..data.len().min(MAX_VALUE_BYTES)];
    let sep = settings.separator();
    let mut out = header(settings, address, data.len() as u8 + 2);
    let _ = write!(out, "{:02X}{}{:02X}", mode.wrapping_add(0x40), sep, pid);
    for byte in data {
        let _ = write!(out, "{}{:02X}", sep, byte);
    }
    if settings.headers {
        let checksum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        let _ = write!(out, "{}{:02X}", sep, checksum);
    }
    out
}

/// Stored trouble codes, three per line, padded with `00 00`
pub fn format_error_lines(settings: &SimSettings, address: u8, codes: &[[u8; 2]]) -> Vec<String> {
    let sep = settings.separator();
    codes
        .chunks(3)
        .map(|chunk| {
            let mut out = header(settings, address, FIXED_REPLY_LEN);
            let _ = write!(out, "{:02X}", 0x40 + mode::READ_DTC);
            for i in 0..3 {
                let [a, b] = chunk.get(i).copied().unwrap_or([0, 0]);
                let _ = write!(out, "{}{:02X}{}{:02X}", sep, a, sep, b);
            }
            out
        })
        .collect()
}

/// A stored freeze frame value
pub fn format_freeze_reply(
    settings: &SimSettings,
    address: u8,
    pid: u8,
    frame: usize,
    data: &[u8],
) -> String {
    let sep = settings.separator();
    let mut out = header(settings, address, FIXED_REPLY_LEN);
    let _ = write!(
        out,
        "{:02X}{}{:02X}{}{:02X}",
        0x40 + mode::FREEZE_FRAME,
        sep,
        pid,
        sep,
        frame
    );
    for byte in data {
        let _ = write!(out, "{}{:02X}", sep, byte);
    }
    out
}

/// What a request produced
#[derive(Debug, Default)]
struct QueryOutcome {
    /// Lines sent, `NO DATA` when zero
    responses: usize,
    /// ECUs that answered within the timeout
    replied: usize,
    elapsed: Duration,
    exit: bool,
}

pub struct ResponderEngine<P> {
    port: P,
    ecus: EcuSet,
    settings: SimSettings,
    identity: AdapterIdentity,
    previous_line: String,
    benchmark: Option<Benchmark>,
}

impl<P: SimPort> ResponderEngine<P> {
    pub fn new(
        mut port: P,
        ecus: EcuSet,
        settings: SimSettings,
        identity: AdapterIdentity,
    ) -> Self {
        port.set_echo(settings.echo);
        Self {
            port,
            ecus,
            settings,
            identity,
            previous_line: String::new(),
            benchmark: None,
        }
    }

    /// Log throughput every `period`
    pub fn with_benchmark(mut self, period: Duration) -> Self {
        self.benchmark = Some(Benchmark::new(period));
        self
    }

    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Serve requests until `EXIT`, a source asks to stop, or the client
    /// goes away
    pub async fn run(&mut self) -> Result<(), SimError> {
        info!(
            "Simulating {} ECUs on {} ({})",
            self.ecus.len(),
            self.port.name(),
            self.settings.protocol.protocol.description()
        );
        loop {
            match self.tick().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => {
                    info!("Simulator exiting");
                    return Ok(());
                }
                Err(SimError::Disconnected) => {
                    info!("Client disconnected, simulator exiting");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One loop iteration: idle the sources, capture freeze frames and
    /// answer at most one line
    pub async fn tick(&mut self) -> Result<Flow, SimError> {
        let started = Instant::now();
        if let Some(benchmark) = self.benchmark.as_mut() {
            benchmark.report_if_due();
        }

        let budget = TICK / self.ecus.len().max(1) as u32;
        for ecu in self.ecus.iter_mut() {
            if !ecu.source.idle(budget) {
                info!("ECU {} ({}) asked to stop", ecu.address, ecu.source.name());
                return Ok(Flow::Exit);
            }
        }
        for ecu in self.ecus.iter_mut() {
            ecu.capture_freeze_frame();
        }

        let wait = TICK.saturating_sub(started.elapsed());
        match self.port.read_line(wait).await? {
            Some(line) => self.handle_line(line).await,
            None => Ok(Flow::Continue),
        }
    }

    async fn handle_line(&mut self, line: String) -> Result<Flow, SimError> {
        let line = if line.is_empty() {
            self.previous_line.clone()
        } else {
            self.previous_line.clone_from(&line);
            line
        };
        if let Some(benchmark) = self.benchmark.as_mut() {
            benchmark.total += 1;
        }

        let line = line.to_ascii_uppercase();
        debug!("Request: {}", line);
        if line.contains("EXIT") {
            info!("Received EXIT from client");
            return Ok(Flow::Exit);
        }
        if line.starts_with("AT") {
            self.handle_at(&line).await?;
            return Ok(Flow::Continue);
        }
        self.handle_request(&line).await
    }

    async fn handle_at(&mut self, line: &str) -> Result<(), SimError> {
        let text = match handle_at_command(line, &mut self.settings, &self.identity) {
            Some(reply) => {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                reply.text
            }
            None => {
                debug!("Unrecognised AT command {}", line);
                "?".to_string()
            }
        };
        self.port.set_echo(self.settings.echo);
        let out = format!("{}{}{}", text, self.settings.newline(), PROMPT);
        self.port.write_data(&out).await
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SimError> {
        let out = format!("{}{}", line, self.settings.newline());
        self.port.write_data(&out).await
    }

    async fn handle_request(&mut self, line: &str) -> Result<Flow, SimError> {
        let vals = scan_request(line);
        let timeout = Duration::from_millis(self.settings.timeout_ms);

        let outcome = match *vals.as_slice() {
            [] => self.reject().await?,
            [m] if m == u32::from(mode::READ_DTC) || m == u32::from(mode::PENDING_DTC) => {
                self.send_error_codes().await?
            }
            [m] if m == u32::from(mode::CLEAR_DTC) => {
                for ecu in self.ecus.iter_mut() {
                    ecu.source.clear_error_codes();
                }
                info!("Trouble codes cleared");
                self.send_line("OK").await?;
                QueryOutcome {
                    responses: 1,
                    ..QueryOutcome::default()
                }
            }
            [_] => self.reject().await?,
            [_, pid, ..] if PidCatalog::lookup_by_pid(pid as u8).is_none() => self.reject().await?,
            [m, pid, ..] if m == u32::from(mode::FREEZE_FRAME) => {
                let frame = vals.get(2).copied().unwrap_or(0) as usize;
                self.send_freeze_frame(pid as u8, frame).await?
            }
            [m, pid, ..] if m == u32::from(mode::CURRENT_DATA) => {
                self.query_ecus(pid as u8, timeout).await?
            }
            [m, ..] => {
                debug!("Mode {:02X} not simulated", m);
                QueryOutcome::default()
            }
        };

        let unhinted = vals.first() == Some(&u32::from(mode::CURRENT_DATA)) && vals.len() <= 2;
        if outcome.replied < self.ecus.len() || unhinted {
            tokio::time::sleep(timeout.saturating_sub(outcome.elapsed)).await;
        }

        if outcome.responses == 0 {
            self.send_line("NO DATA").await?;
        } else if let Some(benchmark) = self.benchmark.as_mut() {
            benchmark.good += 1;
        }
        self.port.write_data(&PROMPT.to_string()).await?;

        Ok(if outcome.exit { Flow::Exit } else { Flow::Continue })
    }

    async fn reject(&mut self) -> Result<QueryOutcome, SimError> {
        self.send_line("?").await?;
        Ok(QueryOutcome {
            responses: 1,
            ..QueryOutcome::default()
        })
    }

    async fn send_error_codes(&mut self) -> Result<QueryOutcome, SimError> {
        let mut lines = Vec::new();
        for ecu in self.ecus.iter_mut() {
            let Some(report) = ecu.source.error_codes() else {
                continue;
            };
            lines.extend(format_error_lines(&self.settings, ecu.address, &report.codes));
        }
        for line in &lines {
            self.send_line(line).await?;
        }
        Ok(QueryOutcome {
            responses: lines.len(),
            ..QueryOutcome::default()
        })
    }

    async fn send_freeze_frame(&mut self, pid: u8, frame: usize) -> Result<QueryOutcome, SimError> {
        let mut lines = Vec::new();
        if frame < MAX_FREEZE_FRAMES {
            for ecu in self.ecus.iter() {
                let Some(data) = ecu.freeze.frame(frame).and_then(|f| f.get(pid)) else {
                    continue;
                };
                if !data.is_empty() {
                    lines.push(format_freeze_reply(&self.settings, ecu.address, pid, frame, data));
                }
            }
        }
        for line in &lines {
            self.send_line(line).await?;
        }
        Ok(QueryOutcome {
            responses: lines.len(),
            ..QueryOutcome::default()
        })
    }

    /// Ask every ECU that answers within `timeout`, fastest first
    async fn query_ecus(&mut self, pid: u8, timeout: Duration) -> Result<QueryOutcome, SimError> {
        let (replies, elapsed) = schedule(self.ecus.order(), timeout);
        let skipped = self.ecus.len() - replies.len();
        if skipped > 0 {
            debug!("{} ECUs too slow for {}ms timeout", skipped, timeout.as_millis());
        }

        let mut outcome = QueryOutcome {
            replied: replies.len(),
            elapsed,
            ..QueryOutcome::default()
        };
        for (index, delta) in replies {
            if !delta.is_zero() {
                tokio::time::sleep(delta).await;
            }
            let Some(ecu) = self.ecus.get_mut(index) else {
                continue;
            };
            let address = ecu.address;
            let data = match ecu.source.get_value(mode::CURRENT_DATA, pid) {
                Reading::Exit => {
                    info!("ECU {} ({}) asked to stop", address, ecu.source.name());
                    outcome.exit = true;
                    break;
                }
                Reading::Data(data) => data,
            };
            if data.is_empty() {
                continue;
            }
            let line = format_value_reply(&self.settings, address, mode::CURRENT_DATA, pid, &data);
            self.send_line(&line).await?;
            outcome.responses += 1;
        }
        Ok(outcome)
    }
}
