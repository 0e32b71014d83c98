//! The statsd server worker: a mio-driven UDP read loop feeding the shared
//! aggregator, and the flush side rolling it up into samples.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::thread::JoinHandle;
use std::time::Duration;

use bucky3_core::clock::ClockSource;
use bucky3_core::connector::bind_udp;
use bucky3_core::error::CoreError;
use bucky3_core::resolver::resolve_local;
use bucky3_core::sample::{Sample, Scalar, Timestamp};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{ShutdownFlag, SourceOutput, Worker};
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error};

use crate::aggregator::{Aggregator, AggregatorConfig};

/// Default statsd listening port.
pub const DEFAULT_PORT: u16 = 8125;

/// Largest possible UDP payload.
const RECV_BUFFER_SIZE: usize = 65535;

const READER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(350);

#[derive(Clone)]
pub struct StatsdConfig {
    pub local_host: String,
    pub aggregator: AggregatorConfig,
    pub add_timestamps: bool,
}

/// The flush half of the statsd server. The read half runs on a dedicated
/// thread spawned at construction; both share the aggregator.
pub struct StatsdServer {
    name: String,
    aggregator: Arc<Aggregator>,
    output: Arc<SourceOutput>,
    add_timestamps: bool,
    last_flush: Timestamp,
    local_addr: std::net::SocketAddr,
    // Exits on the shutdown flag; dropping the handle detaches it so a
    // worker restart is never blocked on the old reader.
    _reader: JoinHandle<()>,
}

impl StatsdServer {
    /// Bind the UDP socket and start the read thread. A bind failure is
    /// fatal for the worker (and, repeated, trips the supervisor's
    /// crash-loop detector).
    pub fn new(
        name: &str,
        cfg: StatsdConfig,
        clock: ClockSource,
        output: SourceOutput,
        shutdown: ShutdownFlag,
    ) -> Result<Self, CoreError> {
        let addr = resolve_local(&cfg.local_host, DEFAULT_PORT)?;
        let socket = bind_udp(addr)?;
        let local_addr = socket.local_addr()?;

        let aggregator = Arc::new(Aggregator::new(cfg.aggregator));
        let reader = spawn_read_loop(
            format!("{name}-udp"),
            socket,
            Arc::clone(&aggregator),
            clock.clone(),
            shutdown,
        )?;

        Ok(Self {
            name: name.to_string(),
            aggregator,
            output: Arc::new(output),
            add_timestamps: cfg.add_timestamps,
            last_flush: clock.epoch_timestamp(),
            local_addr,
            _reader: reader,
        })
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// The actual bound address (relevant when configured with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Worker for StatsdServer {
    fn flush(&mut self, timestamp: Timestamp) -> bool {
        let interval = timestamp - self.last_flush;
        let default_timestamp = self.add_timestamps.then_some(timestamp);

        let output = &self.output;
        self.aggregator
            .flush(timestamp, interval, default_timestamp, |bucket, values, ts, metadata| {
                output.buffer_metric(bucket, values, ts, metadata);
            });
        self.last_flush = timestamp;
        self.output.flush_chunks()
    }

    fn self_report(&mut self, timestamp: Timestamp, health: WorkerHealth) {
        let mut fields = health.into_fields();
        fields.insert(
            "metrics_received".to_string(),
            Scalar::Int(self.aggregator.metrics_received() as i64),
        );
        fields.insert(
            "metrics_produced".to_string(),
            Scalar::Int(self.output.counters().metrics_produced.load(Relaxed) as i64),
        );
        fields.insert(
            "metrics_dropped".to_string(),
            Scalar::Int(self.output.counters().metrics_dropped.load(Relaxed) as i64),
        );

        let Sample {
            bucket,
            values,
            timestamp,
            metadata,
        } = self_report_sample(&self.name, timestamp, fields);
        self.output.buffer_metric(&bucket, values, timestamp, metadata);
    }
}

/// Poll-based UDP read loop. Drains the socket after every readable event,
/// handing each datagram to the aggregator; exits when the shutdown flag is
/// set.
fn spawn_read_loop(
    thread_name: String,
    socket: UdpSocket,
    aggregator: Arc<Aggregator>,
    clock: ClockSource,
    shutdown: ShutdownFlag,
) -> Result<JoinHandle<()>, CoreError> {
    let mut socket = MioUdpSocket::from_std(socket);
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut socket, READER, Interest::READABLE)?;

    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || read_loop(socket, poll, aggregator, clock, shutdown))
        .map_err(CoreError::Io)?;
    Ok(handle)
}

fn read_loop(
    socket: MioUdpSocket,
    mut poll: Poll,
    aggregator: Arc<Aggregator>,
    clock: ClockSource,
    shutdown: ShutdownFlag,
) {
    let mut events = Events::with_capacity(16);
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while !shutdown.is_set() {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!("UDP poll failed: {e}");
            return;
        }

        loop {
            match socket.recv_from(&mut buf) {
                Ok((nbytes, _addr)) => {
                    let recv_timestamp = clock.epoch_timestamp();
                    // Non-UTF8 payloads are dropped whole.
                    if let Ok(payload) = std::str::from_utf8(&buf[..nbytes]) {
                        aggregator.handle_packet(recv_timestamp, payload);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("UDP recv failed: {e}");
                    break;
                }
            }
        }
    }
}
