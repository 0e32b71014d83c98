//! The worker contract and the loop that drives it.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::ClockSource;
use crate::pipe::{FanIn, FanInEvent, PipeSender};
use crate::sample::{Metadata, Sample, Timestamp, Values, merge_metadata};
use crate::scheduler::FlushScheduler;
use crate::selfreport::WorkerHealth;

/// Upper bound on a single poll/sleep so the shutdown flag and flush
/// deadlines are observed promptly.
const POLL_SLICE: Duration = Duration::from_millis(350);

/// Self-reports are produced at most this often.
const SELF_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Cooperative termination signal shared by the supervisor and its workers.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Acquire)
    }
}

/// Outcome of a worker's poll step.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    /// The worker's inputs are gone for good; leave the loop.
    Exit,
}

/// A source or destination module body, driven by [`WorkerRunner`].
/// Workers are built and driven on their own thread, so the trait does not
/// demand `Send`.
pub trait Worker {
    /// Roll up state and ship or enqueue output. Returning false triggers
    /// flush back-off.
    fn flush(&mut self, timestamp: Timestamp) -> bool;

    /// Block for at most `wait`, doing worker-specific intake (pipe fan-in,
    /// journal reads). The default just sleeps; workers with dedicated
    /// reader threads need nothing else.
    fn poll(&mut self, wait: Duration) -> PollOutcome {
        std::thread::sleep(wait);
        PollOutcome::Continue
    }

    /// Emit the worker's internal health sample. Only called when
    /// self-reporting is enabled.
    fn self_report(&mut self, _timestamp: Timestamp, _health: WorkerHealth) {}
}

/// Per-worker loop: startup jitter, tick/flush with back-off, self-report
/// cadence, shutdown polling. Termination is cooperative; after the flag is
/// set the worker exits once its current flush completes.
pub struct WorkerRunner {
    name: String,
    clock: ClockSource,
    scheduler: FlushScheduler,
    shutdown: ShutdownFlag,
    randomize_startup: bool,
    self_report: bool,
}

impl WorkerRunner {
    pub fn new(
        name: impl Into<String>,
        clock: ClockSource,
        scheduler: FlushScheduler,
        shutdown: ShutdownFlag,
        randomize_startup: bool,
        self_report: bool,
    ) -> Self {
        Self {
            name: name.into(),
            clock,
            scheduler,
            shutdown,
            randomize_startup,
            self_report,
        }
    }

    pub fn run<W: Worker>(mut self, mut worker: W) {
        info!("{} set up", self.name);

        if self.randomize_startup {
            self.sleep_interruptibly(self.scheduler.startup_jitter());
        }

        let started = Instant::now();
        let mut next_self_report = started + SELF_REPORT_INTERVAL;

        while !self.shutdown.is_set() {
            let now = Instant::now();
            if self.scheduler.due(now) {
                debug!("{} flush", self.name);
                let ok = worker.flush(self.clock.epoch_timestamp());
                self.scheduler.record(Instant::now(), ok);
                if !ok {
                    warn!(
                        "{} flush error, next in {} secs",
                        self.name,
                        self.scheduler.flush_interval().as_secs()
                    );
                }
            }

            if self.self_report && Instant::now() >= next_self_report {
                let health = WorkerHealth::measure(started, self.scheduler.flush_errors());
                worker.self_report(self.clock.epoch_timestamp(), health);
                next_self_report = Instant::now() + SELF_REPORT_INTERVAL;
            }

            let wait = self.scheduler.time_to_next(Instant::now()).min(POLL_SLICE);
            if worker.poll(wait.max(Duration::from_millis(1))) == PollOutcome::Exit {
                warn!("{} inputs not ready, quitting", self.name);
                return;
            }
        }

        info!("{} exiting", self.name);
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.shutdown.is_set() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(POLL_SLICE));
        }
    }
}

/// Counters a source exposes through its self-report.
#[derive(Debug, Default)]
pub struct SourceCounters {
    pub metrics_produced: AtomicU64,
    pub metrics_dropped: AtomicU64,
}

/// Outbound side of a source worker: metadata merging, the sample buffer and
/// chunked fan-out to every destination pipe.
pub struct SourceOutput {
    destinations: Vec<PipeSender>,
    metadata: Metadata,
    chunk_size: usize,
    buffer: Mutex<Vec<Sample>>,
    counters: SourceCounters,
}

impl SourceOutput {
    pub fn new(destinations: Vec<PipeSender>, metadata: Metadata, chunk_size: usize) -> Self {
        Self {
            destinations,
            metadata,
            chunk_size: chunk_size.max(1),
            buffer: Mutex::new(Vec::new()),
            counters: SourceCounters::default(),
        }
    }

    pub fn counters(&self) -> &SourceCounters {
        &self.counters
    }

    /// Merge worker metadata into the sample (sample keys win), apply the
    /// `bucket` metadata override, and append to the outbound buffer.
    pub fn buffer_metric(
        &self,
        bucket: &str,
        values: Values,
        timestamp: Option<Timestamp>,
        mut metadata: Metadata,
    ) {
        merge_metadata(&mut metadata, &self.metadata);
        let bucket = match metadata.remove("bucket") {
            Some(bucket) => bucket,
            None => bucket.to_string(),
        };

        let sample = Sample {
            bucket,
            values,
            timestamp,
            metadata,
        };
        self.buffer.lock().unwrap().push(sample);
        self.counters.metrics_produced.fetch_add(1, Relaxed);
    }

    /// Drain the buffer in chunks, delivering every chunk to every
    /// destination pipe.
    pub fn flush_chunks(&self) -> bool {
        loop {
            let chunk: Vec<Sample> = {
                let mut buffer = self.buffer.lock().unwrap();
                if buffer.is_empty() {
                    break;
                }
                let take = buffer.len().min(self.chunk_size);
                buffer.drain(..take).collect()
            };
            debug!("flushing {} entries from buffer", chunk.len());
            for destination in &self.destinations {
                destination.send(chunk.clone());
            }
        }
        true
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

/// Inbound side of a destination worker: pipe fan-in plus symmetric metadata
/// merging.
pub struct DestinationInput {
    fan_in: FanIn,
    metadata: Metadata,
    metrics_received: u64,
}

impl DestinationInput {
    pub fn new(fan_in: FanIn, metadata: Metadata) -> Self {
        Self {
            fan_in,
            metadata,
            metrics_received: 0,
        }
    }

    pub fn metrics_received(&self) -> u64 {
        self.metrics_received
    }

    /// Wait up to `wait` for one inbound chunk and hand each of its samples
    /// to `process`, with worker metadata filling gaps.
    pub fn poll<F>(&mut self, wait: Duration, clock: &ClockSource, mut process: F) -> PollOutcome
    where
        F: FnMut(Timestamp, Sample),
    {
        match self.fan_in.poll(wait) {
            FanInEvent::Idle => PollOutcome::Continue,
            FanInEvent::Exhausted => PollOutcome::Exit,
            FanInEvent::Batch(batch) => {
                let recv_timestamp = clock.epoch_timestamp();
                for mut sample in batch {
                    merge_metadata(&mut sample.metadata, &self.metadata);
                    process(recv_timestamp, sample);
                    self.metrics_received += 1;
                }
                PollOutcome::Continue
            }
        }
    }

    /// Feed a self-report sample straight into the destination's own
    /// processing path, so it reaches the backend this worker fronts.
    pub fn inject<F>(&mut self, clock: &ClockSource, mut sample: Sample, mut process: F)
    where
        F: FnMut(Timestamp, Sample),
    {
        merge_metadata(&mut sample.metadata, &self.metadata);
        process(clock.epoch_timestamp(), sample);
    }
}
