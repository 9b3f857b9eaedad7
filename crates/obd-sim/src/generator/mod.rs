//! ECU value sources
//!
//! Each simulated ECU answers from a [`ValueSource`]. Sources are picked by
//! name at startup from [`GENERATORS`] and configured with a free-form seed.

mod cycle;
mod error;
mod random;

pub use cycle::CycleSource;
pub use error::ErrorSource;
pub use random::RandomSource;

use crate::error::SimError;
use std::time::Duration;

/// Result of asking a source for a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// Up to four data bytes; empty means the PID is not supported
    Data(Vec<u8>),
    /// The source wants the whole simulator to stop
    Exit,
}

impl Reading {
    pub fn none() -> Self {
        Reading::Data(Vec::new())
    }
}

/// Stored trouble codes of one ECU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    /// Wire bytes of each code
    pub codes: Vec<[u8; 2]>,
    pub mil: bool,
}

/// Something that can play the part of an ECU
pub trait ValueSource: Send {
    fn name(&self) -> &'static str;

    /// Data bytes for `(mode, pid)`
    fn get_value(&mut self, mode: u8, pid: u8) -> Reading;

    /// Called once per simulator tick with the time it may spend.
    /// Returning false stops the simulator.
    fn idle(&mut self, _budget: Duration) -> bool {
        true
    }

    /// Current trouble codes, `None` for sources that never report any
    fn error_codes(&mut self) -> Option<ErrorReport> {
        None
    }

    fn clear_error_codes(&mut self) {}
}

type Constructor = fn(&str) -> Result<Box<dyn ValueSource>, SimError>;

/// A registered source type
pub struct GeneratorInfo {
    pub name: &'static str,
    pub description: &'static str,
    create: Constructor,
}

impl GeneratorInfo {
    pub fn create(&self, seed: &str) -> Result<Box<dyn ValueSource>, SimError> {
        (self.create)(seed)
    }
}

/// Every available source type
pub static GENERATORS: [GeneratorInfo; 3] = [
    GeneratorInfo {
        name: "Cycle",
        description: "Cycle through a wide range of valid OBDII values\n\
                      Seed: [cycle-length-in-seconds[,number-of-gears]]",
        create: create_cycle,
    },
    GeneratorInfo {
        name: "Random",
        description: "Generate random numbers\nSeed: [random number seed]",
        create: create_random,
    },
    GeneratorInfo {
        name: "Error",
        description: "Generate MIL errors\nSeed: Ignored",
        create: create_error,
    },
];

fn create_cycle(seed: &str) -> Result<Box<dyn ValueSource>, SimError> {
    Ok(Box::new(CycleSource::from_seed(seed)?))
}

fn create_random(seed: &str) -> Result<Box<dyn ValueSource>, SimError> {
    Ok(Box::new(RandomSource::from_seed(seed)?))
}

fn create_error(_seed: &str) -> Result<Box<dyn ValueSource>, SimError> {
    Ok(Box::new(ErrorSource::new()))
}

/// Name of the source used when none is given
pub const DEFAULT_GENERATOR: &str = "Cycle";

pub fn find_generator(name: &str) -> Option<&'static GeneratorInfo> {
    GENERATORS.iter().find(|g| g.name.eq_ignore_ascii_case(name))
}

/// Build a source by registry name
pub fn create_generator(name: &str, seed: &str) -> Result<Box<dyn ValueSource>, SimError> {
    find_generator(name)
        .ok_or_else(|| SimError::UnknownGenerator(name.to_string()))?
        .create(seed)
}
