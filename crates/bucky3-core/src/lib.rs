//! Shared machinery for bucky3 workers.
//!
//! Every module of the agent, source or destination, is built from the same
//! pieces: a [`Sample`](sample::Sample) flowing over [`pipe`]s, a
//! [`FlushScheduler`](scheduler::FlushScheduler) driving periodic flushes with
//! exponential back-off, and a [`WorkerRunner`](worker::WorkerRunner) that
//! owns the tick loop, shutdown polling and self-report cadence. Destinations
//! additionally use the [`push`] buffer and the [`connector`]s.

#![deny(unsafe_code)]

pub mod clock;
pub mod connector;
pub mod error;
pub mod pipe;
pub mod push;
pub mod resolver;
pub mod sample;
pub mod scheduler;
pub mod selfreport;
pub mod worker;
