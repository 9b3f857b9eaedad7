//! In-memory repository

use crate::sink::{Sample, SampleSink, TripRecord};
use crate::StorageError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, info};

/// Repository for data access without a database, used for dry runs and
/// tests
pub struct MemoryRepository {
    /// Sample rows, oldest first
    samples: Mutex<VecDeque<Sample>>,
    trips: Mutex<Vec<TripRecord>>,
    /// Max sample rows (a day at 1Hz, a few hours at full rate)
    max_samples: usize,
    next_trip_id: Mutex<i64>,
}

fn lock_error<T>(e: std::sync::PoisonError<T>) -> StorageError {
    StorageError::DatabaseError(format!("Lock error: {}", e))
}

impl MemoryRepository {
    pub fn new() -> Self {
        info!("Creating in-memory repository");
        Self {
            samples: Mutex::new(VecDeque::with_capacity(10000)),
            trips: Mutex::new(Vec::new()),
            max_samples: 100_000,
            next_trip_id: Mutex::new(1),
        }
    }

    /// Most recent samples, newest first
    pub fn get_samples(&self, limit: usize) -> Result<Vec<Sample>, StorageError> {
        let samples = self.samples.lock().map_err(lock_error)?;
        Ok(samples.iter().rev().take(limit).cloned().collect())
    }

    /// Samples belonging to `trip`, oldest first
    pub fn samples_for_trip(&self, trip: i64) -> Result<Vec<Sample>, StorageError> {
        let samples = self.samples.lock().map_err(lock_error)?;
        Ok(samples.iter().filter(|s| s.trip == trip).cloned().collect())
    }

    pub fn trips(&self) -> Result<Vec<TripRecord>, StorageError> {
        Ok(self.trips.lock().map_err(lock_error)?.clone())
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
        if let Ok(mut trips) = self.trips.lock() {
            trips.clear();
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleSink for MemoryRepository {
    async fn start_trip(&self, start: f64) -> Result<i64, StorageError> {
        let mut trips = self.trips.lock().map_err(lock_error)?;
        let mut id = self.next_trip_id.lock().map_err(lock_error)?;

        let trip = TripRecord {
            id: *id,
            start,
            end: -1.0,
        };
        *id += 1;
        debug!("Started trip {}", trip.id);
        trips.push(trip);
        Ok(*id - 1)
    }

    async fn update_trip_end(&self, trip: i64, end: f64) -> Result<(), StorageError> {
        let mut trips = self.trips.lock().map_err(lock_error)?;
        let record = trips
            .iter_mut()
            .find(|t| t.id == trip)
            .ok_or(StorageError::NotFound)?;
        record.end = end;
        Ok(())
    }

    async fn insert_sample(&self, sample: &Sample) -> Result<(), StorageError> {
        let mut samples = self.samples.lock().map_err(lock_error)?;

        // Enforce retention
        while samples.len() >= self.max_samples {
            samples.pop_front();
        }

        samples.push_back(sample.clone());
        Ok(())
    }
}
