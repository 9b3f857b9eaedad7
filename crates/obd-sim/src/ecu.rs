//! Simulated ECUs
//!
//! An [`Ecu`] pairs a bus address with a [`ValueSource`], a reply delay and
//! its own freeze-frame history. [`EcuSet`] keeps the ECUs in the order the
//! user configured them and precomputes the delay order replies go out in.

use crate::error::SimError;
use crate::generator::{Reading, ValueSource};
use obd_protocol::{mode, PidCatalog};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Most ECUs one simulator can host
pub const MAX_ECUS: usize = 6;

/// Freeze frames kept per ECU
pub const MAX_FREEZE_FRAMES: usize = 5;

/// One captured snapshot, PID to reply bytes (empty when unsupported)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreezeFrame {
    pub values: BTreeMap<u8, Vec<u8>>,
}

impl FreezeFrame {
    pub fn get(&self, pid: u8) -> Option<&[u8]> {
        self.values.get(&pid).map(Vec::as_slice)
    }
}

/// Snapshots taken whenever the error count changes
#[derive(Debug, Default)]
pub struct FreezeFrameStore {
    frames: Vec<FreezeFrame>,
    last_error_count: usize,
}

impl FreezeFrameStore {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> Option<&FreezeFrame> {
        self.frames.get(index)
    }

    /// Run one capture step against `source`.
    /// Returns true when a new frame was stored.
    pub fn capture(&mut self, address: u8, source: &mut dyn ValueSource) -> bool {
        let Some(report) = source.error_codes() else {
            return false;
        };
        let count = report.codes.len();

        if count == 0 {
            if !self.frames.is_empty() {
                debug!("ECU {} errors cleared, dropping {} freeze frames", address, self.frames.len());
            }
            self.frames.clear();
            self.last_error_count = 0;
            return false;
        }
        if count == self.last_error_count {
            return false;
        }
        if self.frames.len() >= MAX_FREEZE_FRAMES {
            warn!("ECU {} freeze frame store full, dropping capture", address);
            self.last_error_count = count;
            return false;
        }

        let mut frame = FreezeFrame::default();
        for cmd in PidCatalog::entries() {
            let bytes = match source.get_value(mode::CURRENT_DATA, cmd.pid) {
                Reading::Data(bytes) => bytes,
                Reading::Exit => Vec::new(),
            };
            frame.values.insert(cmd.pid, bytes);
        }
        self.frames.push(frame);
        self.last_error_count = count;
        debug!(
            "ECU {} captured freeze frame {} at {} errors",
            address,
            self.frames.len() - 1,
            count
        );
        true
    }
}

pub struct Ecu {
    /// Logical address, mapped to a bus address when headers are rendered
    pub address: u8,
    pub delay: Duration,
    pub source: Box<dyn ValueSource>,
    pub freeze: FreezeFrameStore,
}

impl Ecu {
    pub fn new(address: u8, delay: Duration, source: Box<dyn ValueSource>) -> Self {
        Self {
            address,
            delay,
            source,
            freeze: FreezeFrameStore::default(),
        }
    }

    pub fn capture_freeze_frame(&mut self) -> bool {
        self.freeze.capture(self.address, self.source.as_mut())
    }
}

/// Sort by delay (stable, so equal delays keep configuration order) and turn
/// the absolute delays into waits relative to the previous ECU.
pub fn delay_order(delays: &[Duration]) -> Vec<(usize, Duration)> {
    let mut order: Vec<usize> = (0..delays.len()).collect();
    order.sort_by_key(|&i| delays[i]);

    let mut previous = Duration::ZERO;
    order
        .into_iter()
        .map(|i| {
            let delta = delays[i].saturating_sub(previous);
            previous = delays[i];
            (i, delta)
        })
        .collect()
}

/// Pick the ECUs that answer within `timeout`, in reply order.
/// Returns `(index, wait before this reply)` plus the total time spent.
pub fn schedule(order: &[(usize, Duration)], timeout: Duration) -> (Vec<(usize, Duration)>, Duration) {
    let mut elapsed = Duration::ZERO;
    let mut replies = Vec::new();
    for &(index, delta) in order {
        if elapsed + delta > timeout {
            continue;
        }
        elapsed += delta;
        replies.push((index, delta));
    }
    (replies, elapsed)
}

/// The configured ECUs and their reply order
pub struct EcuSet {
    ecus: Vec<Ecu>,
    order: Vec<(usize, Duration)>,
}

impl EcuSet {
    pub fn new(ecus: Vec<Ecu>) -> Result<Self, SimError> {
        if ecus.len() > MAX_ECUS {
            return Err(SimError::TooManyEcus(ecus.len()));
        }
        let delays: Vec<Duration> = ecus.iter().map(|e| e.delay).collect();
        let order = delay_order(&delays);
        Ok(Self { ecus, order })
    }

    pub fn len(&self) -> usize {
        self.ecus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ecus.is_empty()
    }

    pub fn order(&self) -> &[(usize, Duration)] {
        &self.order
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Ecu> {
        self.ecus.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ecu> {
        self.ecus.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Ecu> {
        self.ecus.iter_mut()
    }
}
