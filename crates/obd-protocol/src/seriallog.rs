//! Serial trace log
//!
//! Records every line exchanged with the adapter, one per row, as
//! `HH:MM:SS(out|in): '<line>'` in local time.

use crate::error::ObdError;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use tracing::warn;

/// Direction of a logged line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

pub struct SerialLog {
    writer: LineWriter<File>,
}

impl SerialLog {
    /// Append to the log at `path`, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ObdError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: LineWriter::new(file),
        })
    }

    pub fn record(&mut self, direction: Direction, line: &str) {
        let time = chrono::Local::now().format("%H:%M:%S").to_string();
        let entry = format_entry(&time, direction, line.trim_end_matches(|c: char| c == '\r' || c == '\n'));
        // Trace failures are reported, not propagated
        if let Err(e) = self.writer.write_all(entry.as_bytes()) {
            warn!("Serial log write failed: {}", e);
        }
    }
}

fn format_entry(time: &str, direction: Direction, line: &str) -> String {
    format!("{}({}): '{}'\n", time, direction.as_str(), line)
}
