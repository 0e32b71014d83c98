//! Buffered, budgeted pushes for destinations that ship over the network.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::PushError;

/// Counters a push destination exposes through its self-report.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushCounters {
    pub metrics_sent: u64,
    pub metrics_rejected: u64,
    pub metrics_dropped: u64,
    pub connection_errors: u64,
}

/// Output buffer of already-encoded entries with a size cap and per-flush
/// push budgets.
pub struct PushBuffer<T> {
    entries: Vec<T>,
    buffer_limit: usize,
    chunk_size: usize,
    push_count_limit: usize,
    push_time_limit: Duration,
    counters: PushCounters,
}

impl<T> PushBuffer<T> {
    /// `buffer_limit` is clamped to at least 100; `push_count_limit` defaults
    /// to the buffer limit and `push_time_limit` to a third of the tick
    /// interval (at least 100 ms).
    pub fn new(
        buffer_limit: usize,
        chunk_size: usize,
        push_count_limit: Option<usize>,
        push_time_limit: Option<Duration>,
        tick_interval: Duration,
    ) -> Self {
        let buffer_limit = buffer_limit.max(100);
        Self {
            entries: Vec::new(),
            buffer_limit,
            chunk_size: chunk_size.max(1),
            push_count_limit: push_count_limit.unwrap_or(buffer_limit),
            push_time_limit: push_time_limit
                .unwrap_or(tick_interval / 3)
                .max(Duration::from_millis(100)),
            counters: PushCounters::default(),
        }
    }

    pub fn counters(&self) -> PushCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    /// Drop the oldest half when the buffer has grown past its limit.
    /// Called after every tick so a slow backend degrades to recent data
    /// instead of unbounded memory.
    pub fn trim(&mut self) {
        let len = self.entries.len();
        if len > self.buffer_limit {
            let keep = self.buffer_limit / 2;
            self.entries.drain(..len - keep);
            warn!("buffer trimmed from {len} to {keep} entries");
            self.counters.metrics_dropped += (len - keep) as u64;
        }
    }

    /// Drive `push_chunk` over the buffer until it is empty or a push budget
    /// is exhausted. `push_chunk` returns the indices of entries the backend
    /// rejected; those are re-queued at the front. A connection-level error
    /// aborts the flush, leaves the buffer intact and returns false so the
    /// scheduler backs off.
    pub fn flush<F>(&mut self, mut push_chunk: F) -> bool
    where
        F: FnMut(&[T]) -> Result<Vec<usize>, PushError>,
    {
        if self.entries.is_empty() {
            return true;
        }
        debug!("{} entries in buffer to be pushed", self.entries.len());

        let push_start = Instant::now();
        let mut push_counter = 0usize;
        let mut rejected_entries: Vec<T> = Vec::new();

        let result = loop {
            if self.entries.is_empty() {
                break true;
            }
            if push_counter >= self.push_count_limit {
                break push_counter > rejected_entries.len();
            }
            if push_start.elapsed() >= self.push_time_limit {
                break push_counter > rejected_entries.len();
            }

            let chunk_len = self.entries.len().min(self.chunk_size);
            match push_chunk(&self.entries[..chunk_len]) {
                Ok(rejected) => {
                    let mut chunk: Vec<T> = self.entries.drain(..chunk_len).collect();
                    // Pull rejected entries out back-to-front so the indices
                    // stay valid, then restore their original order.
                    let mut indices: Vec<usize> =
                        rejected.into_iter().filter(|i| *i < chunk_len).collect();
                    indices.sort_unstable();
                    indices.dedup();
                    let mut chunk_rejected = Vec::with_capacity(indices.len());
                    for &index in indices.iter().rev() {
                        chunk_rejected.push(chunk.remove(index));
                    }
                    chunk_rejected.reverse();
                    rejected_entries.extend(chunk_rejected);

                    self.counters.metrics_sent += chunk.len() as u64;
                    self.counters.metrics_rejected += indices.len() as u64;
                    push_counter += chunk_len;
                }
                Err(e) => {
                    warn!("push failed: {e}");
                    self.counters.connection_errors += 1;
                    break false;
                }
            }
        };

        if !rejected_entries.is_empty() {
            rejected_entries.extend(self.entries.drain(..));
            self.entries = rejected_entries;
        }
        if !self.entries.is_empty() {
            warn!("{} entries left over in buffer", self.entries.len());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(limit: usize, chunk: usize) -> PushBuffer<u32> {
        PushBuffer::new(limit, chunk, None, None, Duration::from_secs(3))
    }

    #[test]
    fn empty_flush_succeeds() {
        let mut buf = buffer(100, 10);
        assert!(buf.flush(|_| panic!("must not be called")));
    }

    #[test]
    fn flush_sends_in_chunks() {
        let mut buf = buffer(100, 3);
        for i in 0..8 {
            buf.push(i);
        }

        let mut chunks = Vec::new();
        assert!(buf.flush(|chunk| {
            chunks.push(chunk.to_vec());
            Ok(Vec::new())
        }));

        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7]]);
        assert!(buf.is_empty());
        assert_eq!(buf.counters().metrics_sent, 8);
    }

    #[test]
    fn connection_error_keeps_buffer_and_fails() {
        let mut buf = buffer(100, 10);
        for i in 0..5 {
            buf.push(i);
        }

        let failed = buf.flush(|_| {
            Err(PushError::Connection(std::io::Error::other("reset")))
        });

        assert!(!failed);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.counters().connection_errors, 1);
        assert_eq!(buf.counters().metrics_sent, 0);
    }

    #[test]
    fn rejected_entries_requeue_in_order() {
        let mut buf = buffer(100, 5);
        for i in 0..5 {
            buf.push(i);
        }

        // Backend rejects entries 1 and 3 of the only chunk.
        assert!(buf.flush(|_| Ok(vec![3, 1])));

        assert_eq!(buf.counters().metrics_sent, 3);
        assert_eq!(buf.counters().metrics_rejected, 2);
        assert_eq!(buf.len(), 2);

        let mut seen = Vec::new();
        assert!(buf.flush(|chunk| {
            seen.extend_from_slice(chunk);
            Ok(Vec::new())
        }));
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn count_limit_leaves_remainder() {
        let mut buf = PushBuffer::new(100, 2, Some(4), None, Duration::from_secs(3));
        for i in 0..10 {
            buf.push(i);
        }

        assert!(buf.flush(|_| Ok(Vec::new())));
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.counters().metrics_sent, 4);
    }

    #[test]
    fn trim_drops_oldest_half() {
        let mut buf = buffer(100, 10);
        for i in 0..150 {
            buf.push(i);
        }
        buf.trim();

        assert_eq!(buf.len(), 50);
        assert_eq!(buf.counters().metrics_dropped, 100);

        let mut first = None;
        buf.flush(|chunk| {
            first.get_or_insert(chunk[0]);
            Ok(Vec::new())
        });
        assert_eq!(first, Some(100));
    }

    #[test]
    fn limit_floor_is_100() {
        let mut buf = buffer(10, 10);
        for i in 0..100 {
            buf.push(i);
        }
        buf.trim();
        assert_eq!(buf.len(), 100);
    }
}
