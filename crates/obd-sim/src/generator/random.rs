//! Random bytes for every PID

use super::{Reading, ValueSource};
use crate::error::SimError;
use obd_protocol::PidCatalog;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

pub struct RandomSource {
    rng: StdRng,
}

impl RandomSource {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Empty seed draws from OS entropy
    pub fn from_seed(seed: &str) -> Result<Self, SimError> {
        let seed = seed.trim();
        if seed.is_empty() {
            return Ok(Self {
                rng: StdRng::from_entropy(),
            });
        }
        let value: u64 = seed.parse().map_err(|_| SimError::InvalidSeed {
            generator: "Random",
            seed: seed.to_string(),
        })?;
        info!("Seeding random generator with {}", value);
        Ok(Self::with_seed(value))
    }
}

impl ValueSource for RandomSource {
    fn name(&self) -> &'static str {
        "Random"
    }

    fn get_value(&mut self, _mode: u8, pid: u8) -> Reading {
        match pid {
            0x00 => return Reading::Data(vec![0xFF, 0xFF, 0xFF, 0xFE]),
            p if p >= 0x20 => return Reading::none(),
            _ => {}
        }
        let count = PidCatalog::lookup_by_pid(pid)
            .map(|cmd| usize::from(cmd.expected_bytes).min(4))
            .unwrap_or(4);
        let bytes: [u8; 4] = self.rng.gen();
        Reading::Data(bytes[..count].to_vec())
    }
}
