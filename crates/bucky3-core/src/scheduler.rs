//! Flush scheduling with exponential back-off.

use std::time::{Duration, Instant};

/// Margin subtracted when scheduling the next flush. Kernels occasionally
/// wake a sleeping thread a few millis early, which would make the loop miss
/// an otherwise legit tick.
const FLUSH_SLACK: Duration = Duration::from_millis(30);

/// Default ceiling for the backed-off flush interval.
pub const DEFAULT_MAX_FLUSH_INTERVAL: u64 = 600;

/// Tracks when a worker's next flush is due.
///
/// The flush interval starts equal to the tick interval. Every failed flush
/// doubles it, up to `max_flush_interval`; a successful flush snaps it back.
#[derive(Debug)]
pub struct FlushScheduler {
    tick_interval: Duration,
    flush_interval: Duration,
    max_flush_interval: Duration,
    next_flush: Instant,
    flush_errors: u64,
}

impl FlushScheduler {
    pub fn new(tick_interval_secs: u64, max_flush_interval_secs: Option<u64>) -> Self {
        let tick_interval = Duration::from_secs(tick_interval_secs.max(1));
        let max_flush_interval = Duration::from_secs(
            max_flush_interval_secs
                .unwrap_or(DEFAULT_MAX_FLUSH_INTERVAL)
                .max(tick_interval.as_secs()),
        );

        Self {
            tick_interval,
            flush_interval: tick_interval,
            max_flush_interval,
            next_flush: Instant::now(),
            flush_errors: 0,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn flush_errors(&self) -> u64 {
        self.flush_errors
    }

    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_flush
    }

    /// Time left until the next flush is due.
    pub fn time_to_next(&self, now: Instant) -> Duration {
        self.next_flush.saturating_duration_since(now)
    }

    /// Record the outcome of a flush and schedule the next one.
    pub fn record(&mut self, now: Instant, success: bool) {
        if success {
            self.flush_interval = self.tick_interval;
        } else {
            self.flush_interval = (self.flush_interval * 2).min(self.max_flush_interval);
            self.flush_errors += 1;
        }
        self.next_flush = now + self.flush_interval - FLUSH_SLACK;
    }

    /// Uniform startup delay in `[0, min(tick - 1, 15)]` seconds, applied to
    /// workers that opt in so a fleet restart does not produce synchronized
    /// flushes. Short tick intervals skip the jitter.
    pub fn startup_jitter(&self) -> Duration {
        let tick_secs = self.tick_interval.as_secs();
        if tick_secs <= 3 {
            return Duration::ZERO;
        }
        Duration::from_secs(fastrand::u64(0..=(tick_secs - 1).min(15)))
    }
}
