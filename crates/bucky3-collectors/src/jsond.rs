//! JSON-over-UDP source: ndjson objects, optionally zlib/gzip compressed.

use std::io::Read;
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::thread::JoinHandle;
use std::time::Duration;

use bucky3_core::clock::{ClockSource, round_millis};
use bucky3_core::connector::bind_udp;
use bucky3_core::error::CoreError;
use bucky3_core::resolver::resolve_local;
use bucky3_core::sample::{Sample, Scalar, Timestamp, Values};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{ShutdownFlag, SourceOutput, Worker};
use flate2::read::{GzDecoder, ZlibDecoder};
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error};

/// Default JSON listener port, right next to the statsd one.
pub const DEFAULT_PORT: u16 = 8126;

/// Bucket every accepted object lands in.
const JSOND_BUCKET: &str = "metrics";

const MILLIS_CUTOFF: f64 = 2147483647.0;
const RECV_BUFFER_SIZE: usize = 65535;
const READER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(350);

#[derive(Clone)]
pub struct JsondConfig {
    pub local_host: String,
    pub timestamp_window: f64,
}

/// The flush half of the JSON listener; ingest runs on a reader thread that
/// appends straight to the shared source buffer.
pub struct JsondServer {
    name: String,
    output: Arc<SourceOutput>,
    local_addr: std::net::SocketAddr,
    _reader: JoinHandle<()>,
}

impl JsondServer {
    pub fn new(
        name: &str,
        cfg: JsondConfig,
        clock: ClockSource,
        output: SourceOutput,
        shutdown: ShutdownFlag,
    ) -> Result<Self, CoreError> {
        let addr = resolve_local(&cfg.local_host, DEFAULT_PORT)?;
        let socket = bind_udp(addr)?;
        let local_addr = socket.local_addr()?;

        let output = Arc::new(output);
        let reader = spawn_read_loop(
            format!("{name}-udp"),
            socket,
            cfg.timestamp_window,
            Arc::clone(&output),
            clock,
            shutdown,
        )?;

        Ok(Self {
            name: name.to_string(),
            output,
            local_addr,
            _reader: reader,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Worker for JsondServer {
    fn flush(&mut self, _timestamp: Timestamp) -> bool {
        self.output.flush_chunks()
    }

    fn self_report(&mut self, timestamp: Timestamp, health: WorkerHealth) {
        let mut fields = health.into_fields();
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

fn spawn_read_loop(
    thread_name: String,
    socket: UdpSocket,
    timestamp_window: f64,
    output: Arc<SourceOutput>,
    clock: ClockSource,
    shutdown: ShutdownFlag,
) -> Result<JoinHandle<()>, CoreError> {
    let mut socket = MioUdpSocket::from_std(socket);
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut socket, READER, Interest::READABLE)?;

    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            read_loop(socket, poll, timestamp_window, output, clock, shutdown)
        })
        .map_err(CoreError::Io)?;
    Ok(handle)
}

fn read_loop(
    socket: MioUdpSocket,
    mut poll: Poll,
    timestamp_window: f64,
    output: Arc<SourceOutput>,
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
                    let payload = decompress(&buf[..nbytes]);
                    if let Ok(payload) = std::str::from_utf8(&payload) {
                        handle_packet(&output, recv_timestamp, timestamp_window, payload);
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

/// Transparently accept zlib- or gzip-compressed payloads; anything else is
/// taken verbatim.
fn decompress(data: &[u8]) -> Vec<u8> {
    let mut inflated = Vec::new();
    if ZlibDecoder::new(data).read_to_end(&mut inflated).is_ok() {
        return inflated;
    }
    inflated.clear();
    if GzDecoder::new(data).read_to_end(&mut inflated).is_ok() {
        return inflated;
    }
    data.to_vec()
}

/// Each non-empty line is one candidate object: http://ndjson.org/
fn handle_packet(
    output: &SourceOutput,
    recv_timestamp: Timestamp,
    timestamp_window: f64,
    payload: &str,
) {
    for line in payload.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((values, timestamp)) = parse_object(line, recv_timestamp, timestamp_window) {
            output.buffer_metric(
                JSOND_BUCKET,
                Values::Map(values),
                Some(timestamp),
                Default::default(),
            );
        }
    }
}

/// Accept flat JSON objects whose members are all scalars (or null, which is
/// dropped). A `timestamp` member overrides the receive time; out-of-window
/// timestamps reject the whole object.
fn parse_object(
    line: &str,
    recv_timestamp: Timestamp,
    timestamp_window: f64,
) -> Option<(std::collections::BTreeMap<String, Scalar>, Timestamp)> {
    let parsed: serde_json::Value = serde_json::from_str(line).ok()?;
    let object = parsed.as_object()?;

    let mut values = std::collections::BTreeMap::new();
    let mut timestamp = None;

    for (key, value) in object {
        if key == "timestamp" {
            let mut cust = value.as_f64()?;
            if cust.abs() > MILLIS_CUTOFF {
                cust /= 1000.0;
            }
            if (recv_timestamp - cust).abs() > timestamp_window {
                return None;
            }
            timestamp = Some(round_millis(cust));
            continue;
        }
        let scalar = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(b) => Scalar::Bool(*b),
            serde_json::Value::String(s) => Scalar::Str(s.clone()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64()?),
            },
            // Nested structures disqualify the whole object.
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => return None,
        };
        values.insert(key.clone(), scalar);
    }

    Some((values, timestamp.unwrap_or(recv_timestamp)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};

    use super::*;

    const NOW: f64 = 1700000000.0;

    fn parse(line: &str) -> Option<(std::collections::BTreeMap<String, Scalar>, Timestamp)> {
        parse_object(line, NOW, 600.0)
    }

    #[test]
    fn flat_object_accepted() {
        let (values, ts) = parse(r#"{"cpu": 0.5, "count": 3, "ok": true, "host": "box1"}"#).unwrap();
        assert_eq!(values.get("cpu"), Some(&Scalar::Float(0.5)));
        assert_eq!(values.get("count"), Some(&Scalar::Int(3)));
        assert_eq!(values.get("ok"), Some(&Scalar::Bool(true)));
        assert_eq!(values.get("host"), Some(&Scalar::Str("box1".into())));
        assert_eq!(ts, NOW);
    }

    #[test]
    fn nested_objects_rejected() {
        assert!(parse(r#"{"a": {"b": 1}}"#).is_none());
        assert!(parse(r#"{"a": [1, 2]}"#).is_none());
        assert!(parse(r#"[1, 2]"#).is_none());
        assert!(parse(r#""scalar""#).is_none());
        assert!(parse("not json").is_none());
    }

    #[test]
    fn nulls_are_dropped() {
        let (values, _) = parse(r#"{"a": 1, "b": null}"#).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values.contains_key("a"));
    }

    #[test]
    fn timestamp_member_overrides() {
        let (values, ts) = parse(&format!(r#"{{"a": 1, "timestamp": {}}}"#, NOW - 100.0)).unwrap();
        assert_eq!(ts, NOW - 100.0);
        assert!(!values.contains_key("timestamp"));

        // Milliseconds past 2^31.
        let (_, ts) = parse(&format!(r#"{{"a": 1, "timestamp": {}}}"#, (NOW - 5.0) * 1000.0))
            .unwrap();
        assert_eq!(ts, NOW - 5.0);

        // Outside the window the object is rejected.
        assert!(parse(&format!(r#"{{"a": 1, "timestamp": {}}}"#, NOW - 601.0)).is_none());
        assert!(parse(r#"{"a": 1, "timestamp": "iso"}"#).is_none());
    }

    #[test]
    fn decompression_is_transparent() {
        let raw = br#"{"a": 1}"#;

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(raw).unwrap();
        assert_eq!(decompress(&zlib.finish().unwrap()), raw);

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(raw).unwrap();
        assert_eq!(decompress(&gz.finish().unwrap()), raw);

        assert_eq!(decompress(raw), raw);
    }
}
