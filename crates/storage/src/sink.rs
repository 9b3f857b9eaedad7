//! Persistence contract

use crate::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One logged row: every column read in a sampling pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub values: BTreeMap<String, f64>,
    /// UNIX seconds
    pub time: f64,
    pub trip: i64,
}

/// One driving session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub id: i64,
    pub start: f64,
    /// -1 until the trip has been updated
    pub end: f64,
}

/// Where the logger writes samples and trips
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Open a trip starting at `start`, returning its id
    async fn start_trip(&self, start: f64) -> Result<i64, StorageError>;

    async fn update_trip_end(&self, trip: i64, end: f64) -> Result<(), StorageError>;

    async fn insert_sample(&self, sample: &Sample) -> Result<(), StorageError>;
}
