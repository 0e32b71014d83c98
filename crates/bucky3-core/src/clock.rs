//! A source of wall-clock time.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sample::Timestamp;

use ClockSource::{Mock, System};

/// Wall-clock source shared by the ingest and flush paths of a worker.
///
/// All timestamps in the pipeline are epoch seconds with millisecond
/// resolution. The `Mock` variant (milliseconds in an atomic) exists so the
/// aggregation and scheduling logic can be driven deterministically in tests.
#[derive(Debug, Clone)]
pub enum ClockSource {
    /// The system clock.
    System,

    /// Only for testing. Holds epoch milliseconds.
    Mock(Arc<AtomicU64>),
}

impl ClockSource {
    pub fn new_mock(now: Timestamp) -> ClockSource {
        Mock(Arc::new(AtomicU64::new(to_millis(now))))
    }

    /// Seconds since the Unix epoch, rounded to milliseconds.
    pub fn epoch_timestamp(&self) -> Timestamp {
        match self {
            System => match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(n) => round_millis(n.as_secs_f64()),
                Err(e) => panic!("SystemTime before UNIX EPOCH! {e:?}"),
            },
            Mock(now) => now.load(SeqCst) as f64 / 1000.0,
        }
    }

    /// Sets the current time of this Mock clock.
    /// For test use only.
    pub fn set_time(&self, now: Timestamp) {
        match self {
            System => unreachable!(),
            Mock(n) => n.store(to_millis(now), SeqCst),
        }
    }

    /// Moves this Mock clock forward by `delta` seconds.
    /// For test use only.
    pub fn advance(&self, delta: Timestamp) {
        match self {
            System => unreachable!(),
            Mock(n) => {
                n.fetch_add(to_millis(delta), SeqCst);
            }
        }
    }
}

fn to_millis(seconds: Timestamp) -> u64 {
    (seconds * 1000.0).round() as u64
}

/// Round a timestamp to millisecond resolution.
pub fn round_millis(seconds: Timestamp) -> Timestamp {
    (seconds * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_time_is_rounded() {
        let now = System.epoch_timestamp();
        assert_eq!(now, round_millis(now));
        assert!(now > 1.5e9);
    }

    #[test]
    fn mock_time_manipulation() {
        let clock = ClockSource::new_mock(100.5);
        assert_eq!(clock.epoch_timestamp(), 100.5);

        clock.advance(0.25);
        assert_eq!(clock.epoch_timestamp(), 100.75);

        clock.set_time(42.0);
        assert_eq!(clock.epoch_timestamp(), 42.0);
    }

    #[test]
    fn cloned_clocks_share_underlying_time() {
        let clock1 = ClockSource::new_mock(10.0);
        let clock2 = clock1.clone();

        clock1.set_time(20.0);
        assert_eq!(clock2.epoch_timestamp(), 20.0);
    }
}
