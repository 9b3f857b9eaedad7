//! Sweeps every convertible PID from its minimum to its maximum

use super::{Reading, ValueSource};
use crate::error::SimError;
use obd_protocol::PidCatalog;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const DEFAULT_CYCLE_SECS: u64 = 30;
const DEFAULT_GEARS: u32 = 6;
const RPM_MIN: f64 = 500.0;
const RPM_RANGE: f64 = 6000.0;

pub struct CycleSource {
    cycle: Duration,
    gears: u32,
    started: Instant,
}

impl CycleSource {
    pub fn new(cycle: Duration, gears: u32) -> Self {
        Self {
            cycle,
            gears,
            started: Instant::now(),
        }
    }

    /// Seed is `[cycle-seconds[,gears]]`
    pub fn from_seed(seed: &str) -> Result<Self, SimError> {
        let invalid = || SimError::InvalidSeed {
            generator: "Cycle",
            seed: seed.to_string(),
        };
        let mut parts = seed
            .split(|c: char| c == ',' || c == ' ')
            .filter(|s| !s.is_empty());

        let mut source = Self::new(Duration::from_secs(DEFAULT_CYCLE_SECS), DEFAULT_GEARS);
        if let Some(secs) = parts.next() {
            let secs: u64 = secs.parse().map_err(|_| invalid())?;
            if secs == 0 {
                return Err(invalid());
            }
            info!("Setting cycle length to {} seconds", secs);
            source.cycle = Duration::from_secs(secs);
        }
        if let Some(gears) = parts.next() {
            let gears: u32 = gears.parse().map_err(|_| invalid())?;
            if gears == 0 {
                return Err(invalid());
            }
            info!("Setting gears to {}", gears);
            source.gears = gears;
        }
        Ok(source)
    }

    /// Value for `pid` once `elapsed` has passed since start
    fn value_at(&self, pid: u8, elapsed: Duration) -> Reading {
        match pid {
            0x00 | 0x20 => return Reading::Data(vec![0xFF; 4]),
            0x40 => return Reading::Data(vec![0xFF, 0xFF, 0xFF, 0xFE]),
            p if p >= 0x60 => return Reading::none(),
            _ => {}
        }

        let Some(cmd) = PidCatalog::lookup_by_pid(pid) else {
            return Reading::none();
        };
        if cmd.conversion.is_none() {
            return Reading::none();
        }

        let cycle = self.cycle.as_secs_f64();
        let fraction = (elapsed.as_secs_f64() % cycle) / cycle;

        let value = if cmd.column_name == Some("rpm") {
            let revs = (f64::from(self.gears) * RPM_RANGE * fraction) % RPM_RANGE;
            revs + RPM_MIN
        } else {
            cmd.min + fraction * (cmd.max - cmd.min)
        };

        Reading::Data(cmd.from_value(value).unwrap_or_default())
    }
}

impl ValueSource for CycleSource {
    fn name(&self) -> &'static str {
        "Cycle"
    }

    fn get_value(&mut self, _mode: u8, pid: u8) -> Reading {
        self.value_at(pid, self.started.elapsed())
    }
}
