//! Sampling loop
//!
//! Each pass reads every configured column once, in order. A pass only
//! produces a row when every read succeeded. Trips follow the engine:
//! the first good pass opens one, a pass that fails with a negative
//! answer (engine off, bus asleep) closes it, and an adapter error ends
//! the session.

use crate::config::LoggerConfig;
use crate::error::LoggerError;
use obd_protocol::{CmdDescriptor, ObdClient, ObdError, ObdStatus, Transport};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{Sample, SampleSink};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shortest pause between passes when a pass overran its frame
const MIN_PAUSE: Duration = Duration::from_millis(1);

/// What the collector samples and how often
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub columns: Vec<&'static CmdDescriptor>,
    /// `None` runs passes back to back
    pub frame_time: Option<Duration>,
    pub optimisations: bool,
    pub sample_count: Option<u64>,
    pub print_values: bool,
}

impl CollectorSettings {
    pub fn from_config(config: &LoggerConfig, columns: Vec<&'static CmdDescriptor>) -> Self {
        Self {
            columns,
            frame_time: config.frame_time(),
            optimisations: config.optimisations,
            sample_count: config.sample_count,
            print_values: config.print_values,
        }
    }
}

/// Requests a running collector polls once per pass
#[derive(Debug, Clone, Default)]
pub struct CollectorHandle {
    stop: Arc<AtomicBool>,
    new_trip: Arc<AtomicBool>,
}

impl CollectorHandle {
    /// Finish the current pass, close the trip and return
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// End the current trip and open a fresh one on the next pass
    pub fn start_new_trip(&self) {
        self.new_trip.store(true, Ordering::SeqCst);
    }

    fn take_trip_request(&self) -> bool {
        self.new_trip.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    SampleCount,
    /// The adapter stopped answering
    AdapterError,
}

/// Summary of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorReport {
    pub passes: u64,
    pub samples: u64,
    pub trips: u64,
    pub reason: StopReason,
}

/// Current UNIX time in seconds
fn unix_time() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn reply_status(err: &ObdError) -> ObdStatus {
    match err {
        ObdError::Status(status) => *status,
        _ => ObdStatus::Error,
    }
}

pub struct Collector<T: Transport> {
    client: ObdClient<T>,
    sink: Arc<dyn SampleSink>,
    settings: CollectorSettings,
    handle: CollectorHandle,
    trip: Option<i64>,
}

impl<T: Transport> Collector<T> {
    /// `client` must already be open
    pub fn new(client: ObdClient<T>, sink: Arc<dyn SampleSink>, settings: CollectorSettings) -> Self {
        Self {
            client,
            sink,
            settings,
            handle: CollectorHandle::default(),
            trip: None,
        }
    }

    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }

    /// Sample until stopped, then close the trip and the adapter
    pub async fn run(mut self) -> Result<CollectorReport, LoggerError> {
        info!(
            "Logging {} columns every {:?}",
            self.settings.columns.len(),
            self.settings.frame_time
        );
        let mut passes = 0u64;
        let mut samples = 0u64;
        let mut trips = 0u64;

        let reason = loop {
            if self.handle.is_stopped() {
                break StopReason::Requested;
            }
            if self.settings.sample_count.is_some_and(|n| passes >= n) {
                break StopReason::SampleCount;
            }
            passes += 1;

            let started = Instant::now();
            let now = unix_time();

            if self.handle.take_trip_request() {
                self.end_trip(now).await?;
                self.start_trip(now).await?;
                trips += 1;
            }

            let mut adapter_failed = false;
            match self.sample_pass().await {
                Ok(values) => {
                    let trip = match self.trip {
                        Some(trip) => trip,
                        None => {
                            trips += 1;
                            self.start_trip(now).await?
                        }
                    };
                    let sample = Sample { values, time: now, trip };
                    match self.sink.insert_sample(&sample).await {
                        Ok(()) => samples += 1,
                        Err(e) => warn!("Sample insert failed: {}", e),
                    }
                }
                Err(ObdStatus::Error) => {
                    error!("Adapter error while sampling, exiting");
                    adapter_failed = true;
                }
                Err(status) => {
                    if self.trip.is_some() {
                        info!("Ending current trip ({})", status);
                        self.end_trip(now).await?;
                    }
                }
            }

            if let Some(trip) = self.trip {
                self.sink.update_trip_end(trip, now).await?;
            }
            if adapter_failed {
                break StopReason::AdapterError;
            }

            if let Some(frame) = self.settings.frame_time {
                let pause = frame.saturating_sub(started.elapsed()).max(MIN_PAUSE);
                tokio::time::sleep(pause).await;
            }
        };

        info!("Stopping collector: {:?}", reason);
        self.end_trip(unix_time()).await?;
        if let Err(e) = self.client.close().await {
            warn!("Closing adapter failed: {}", e);
        }

        Ok(CollectorReport {
            passes,
            samples,
            trips,
            reason,
        })
    }

    /// Read every column; the first failure abandons the pass
    async fn sample_pass(&mut self) -> Result<BTreeMap<String, f64>, ObdStatus> {
        let mut values = BTreeMap::new();
        for cmd in &self.settings.columns {
            let Some(column) = cmd.column_name else {
                continue;
            };
            let value = self
                .client
                .get_numeric_value(cmd.pid, self.settings.optimisations)
                .await
                .map_err(|e| reply_status(&e))?;
            if self.settings.print_values {
                info!("{}={}", column, value);
            } else {
                debug!("{}={}", column, value);
            }
            values.insert(column.to_string(), value);
        }
        Ok(values)
    }

    async fn start_trip(&mut self, now: f64) -> Result<i64, LoggerError> {
        let trip = self.sink.start_trip(now).await?;
        info!("Created a new trip ({})", trip);
        self.trip = Some(trip);
        Ok(trip)
    }

    async fn end_trip(&mut self, now: f64) -> Result<(), LoggerError> {
        if let Some(trip) = self.trip.take() {
            debug!("Ending trip {}", trip);
            self.sink.update_trip_end(trip, now).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{BaudSetting, PidCatalog, StreamTransport};
    use obd_sim::{
        AdapterIdentity, Ecu, EcuSet, Reading, ResponderEngine, SimSettings, StreamPort,
        ValueSource,
    };
    use storage::MemoryRepository;
    use tokio::io::DuplexStream;

    /// Answers rpm 1664 and 40 km/h, except while `stalled` covers the
    /// running count of rpm requests
    struct Engine {
        rpm_requests: u32,
        stalled: std::ops::Range<u32>,
        exit_after: Option<u32>,
    }

    impl Engine {
        fn running() -> Self {
            Self {
                rpm_requests: 0,
                stalled: 0..0,
                exit_after: None,
            }
        }
    }

    impl ValueSource for Engine {
        fn name(&self) -> &'static str {
            "Engine"
        }

        fn get_value(&mut self, _mode: u8, pid: u8) -> Reading {
            match pid {
                // rpm and vss only
                0x00 => Reading::Data(vec![0x00, 0x18, 0x00, 0x00]),
                0x0C => {
                    let n = self.rpm_requests;
                    self.rpm_requests += 1;
                    if self.exit_after.is_some_and(|limit| n >= limit) {
                        Reading::Exit
                    } else if self.stalled.contains(&n) {
                        Reading::none()
                    } else {
                        Reading::Data(vec![0x1A, 0x00])
                    }
                }
                0x0D => Reading::Data(vec![40]),
                _ => Reading::none(),
            }
        }
    }

    fn simulator(engine: Engine) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        let port = StreamPort::new(server, "duplex");
        let ecus = EcuSet::new(vec![Ecu::new(0, Duration::ZERO, Box::new(engine))]).unwrap();
        let identity = AdapterIdentity {
            version: "ELM327 v1.3a Test".into(),
            device: "Test".into(),
        };
        let mut responder = ResponderEngine::new(port, ecus, SimSettings::default(), identity);
        tokio::spawn(async move { responder.run().await });
        client
    }

    async fn collector(
        engine: Engine,
        sample_count: Option<u64>,
    ) -> (Collector<StreamTransport<DuplexStream>>, Arc<MemoryRepository>) {
        let mut client = ObdClient::new(StreamTransport::new(simulator(engine)));
        client.open(BaudSetting::Keep, BaudSetting::Keep).await.unwrap();

        let repo = Arc::new(MemoryRepository::new());
        let settings = CollectorSettings {
            columns: PidCatalog::parse_columns("rpm,vss").unwrap(),
            frame_time: Some(Duration::from_secs(1)),
            optimisations: true,
            sample_count,
            print_values: false,
        };
        (Collector::new(client, repo.clone(), settings), repo)
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_recorded() {
        let (collector, repo) = collector(Engine::running(), Some(3)).await;
        let report = collector.run().await.unwrap();

        assert_eq!(report.reason, StopReason::SampleCount);
        assert_eq!((report.passes, report.samples, report.trips), (3, 3, 1));

        let samples = repo.samples_for_trip(1).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].values["rpm"], 1664.0);
        assert_eq!(samples[0].values["vss"], 40.0);

        let trips = repo.trips().unwrap();
        assert_eq!(trips.len(), 1);
        assert!(trips[0].end >= trips[0].start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_splits_trips() {
        let engine = Engine {
            stalled: 3..5,
            ..Engine::running()
        };
        let (collector, repo) = collector(engine, Some(7)).await;
        let report = collector.run().await.unwrap();

        assert_eq!((report.passes, report.samples, report.trips), (7, 5, 2));
        assert_eq!(repo.samples_for_trip(1).unwrap().len(), 3);
        assert_eq!(repo.samples_for_trip(2).unwrap().len(), 2);
        assert!(repo.trips().unwrap().iter().all(|t| t.end >= t.start));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_pass() {
        let (collector, repo) = collector(Engine::running(), None).await;
        collector.handle().stop();
        let report = collector.run().await.unwrap();

        assert_eq!(report.reason, StopReason::Requested);
        assert_eq!(report.passes, 0);
        assert_eq!(repo.sample_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_request_opens_new_trip() {
        let (collector, repo) = collector(Engine::running(), Some(2)).await;
        collector.handle().start_new_trip();
        let report = collector.run().await.unwrap();

        // The request opens the first trip; nothing to end yet
        assert_eq!(report.trips, 1);
        assert_eq!(repo.samples_for_trip(1).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_gone_ends_session() {
        let engine = Engine {
            exit_after: Some(2),
            ..Engine::running()
        };
        let (collector, repo) = collector(engine, None).await;
        let report = collector.run().await.unwrap();

        assert_eq!(report.reason, StopReason::AdapterError);
        assert_eq!(report.samples, 2);
        assert_eq!(repo.trips().unwrap().len(), 1);
    }
}
