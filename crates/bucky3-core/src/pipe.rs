//! Typed channels connecting sources to destinations.
//!
//! The supervisor creates one pipe per (source, destination) pair, never
//! shared, so a destination's fan-in always sees well-formed chunks from a
//! single producer. Senders and receivers are cheap clones; the supervisor
//! keeps its own clones so a crashing worker cannot disconnect a pipe that a
//! restarted instance will need again.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, Sender, bounded};
use tracing::debug;

use crate::sample::Sample;

/// In-flight chunks per pipe. A full pipe blocks the source's flush, which is
/// the intended backpressure: the source backs off, UDP ingest drops at the
/// kernel buffer.
const PIPE_CAPACITY: usize = 64;

/// How long a destination tolerates all of its pipes being gone before it
/// gives up and exits.
const EXHAUSTED_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PipeSender {
    inner: Sender<Vec<Sample>>,
}

#[derive(Clone)]
pub struct PipeReceiver {
    inner: Receiver<Vec<Sample>>,
}

/// Create a new source→destination pipe.
pub fn pipe() -> (PipeSender, PipeReceiver) {
    let (tx, rx) = bounded(PIPE_CAPACITY);
    (PipeSender { inner: tx }, PipeReceiver { inner: rx })
}

impl PipeSender {
    /// Blocking send. Returns false when the pipe is disconnected.
    pub fn send(&self, chunk: Vec<Sample>) -> bool {
        self.inner.send(chunk).is_ok()
    }
}

/// What a fan-in poll produced.
#[derive(Debug)]
pub enum FanInEvent {
    Batch(Vec<Sample>),
    Idle,
    /// Every inbound pipe has been disconnected for longer than the grace
    /// period; the worker should exit.
    Exhausted,
}

/// Bounded-wait receive across all inbound pipes of a destination.
pub struct FanIn {
    receivers: Vec<PipeReceiver>,
    exhausted_since: Option<Instant>,
}

impl FanIn {
    pub fn new(receivers: Vec<PipeReceiver>) -> Self {
        Self {
            receivers,
            exhausted_since: None,
        }
    }

    /// Wait up to `wait` for a chunk from any pipe.
    pub fn poll(&mut self, wait: Duration) -> FanInEvent {
        if self.receivers.is_empty() {
            let since = *self.exhausted_since.get_or_insert_with(Instant::now);
            if since.elapsed() > EXHAUSTED_GRACE {
                return FanInEvent::Exhausted;
            }
            std::thread::sleep(wait.min(Duration::from_secs(1)));
            return FanInEvent::Idle;
        }

        let received = {
            let mut select = Select::new();
            for receiver in &self.receivers {
                select.recv(&receiver.inner);
            }
            match select.select_timeout(wait) {
                Err(_) => return FanInEvent::Idle,
                Ok(oper) => {
                    let index = oper.index();
                    (index, oper.recv(&self.receivers[index].inner))
                }
            }
        };

        match received {
            (_, Ok(batch)) => FanInEvent::Batch(batch),
            (index, Err(_)) => {
                debug!("input pipe {index} disconnected");
                self.receivers.swap_remove(index);
                FanInEvent::Idle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::sample::{Sample, Values};

    fn sample(bucket: &str) -> Sample {
        Sample {
            bucket: bucket.to_string(),
            values: Values::Single(1.0.into()),
            timestamp: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn chunks_arrive_in_order_per_pipe() {
        let (tx, rx) = pipe();
        tx.send(vec![sample("a")]);
        tx.send(vec![sample("b")]);

        let mut fan_in = FanIn::new(vec![rx]);
        let first = match fan_in.poll(Duration::from_millis(100)) {
            FanInEvent::Batch(batch) => batch,
            other => panic!("expected batch, got {other:?}"),
        };
        let second = match fan_in.poll(Duration::from_millis(100)) {
            FanInEvent::Batch(batch) => batch,
            other => panic!("expected batch, got {other:?}"),
        };

        assert_eq!(first[0].bucket, "a");
        assert_eq!(second[0].bucket, "b");
    }

    #[test]
    fn fan_in_times_out_idle() {
        let (_tx, rx) = pipe();
        let mut fan_in = FanIn::new(vec![rx]);
        match fan_in.poll(Duration::from_millis(10)) {
            FanInEvent::Idle => (),
            other => panic!("expected idle, got {other:?}"),
        }
    }

    #[test]
    fn fan_in_drains_before_exhaustion() {
        let (tx, rx) = pipe();
        tx.send(vec![sample("a")]);
        drop(tx);

        let mut fan_in = FanIn::new(vec![rx]);
        match fan_in.poll(Duration::from_millis(10)) {
            FanInEvent::Batch(batch) => assert_eq!(batch[0].bucket, "a"),
            other => panic!("expected batch, got {other:?}"),
        }
        // Disconnect noticed, receiver dropped from the set.
        match fan_in.poll(Duration::from_millis(10)) {
            FanInEvent::Idle => (),
            other => panic!("expected idle, got {other:?}"),
        }
        // Grace period has not elapsed yet.
        match fan_in.poll(Duration::from_millis(10)) {
            FanInEvent::Idle => (),
            other => panic!("expected idle, got {other:?}"),
        }
    }
}
