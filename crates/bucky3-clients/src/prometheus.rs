//! Prometheus text-exposition exporter.
//!
//! Samples land in an indexed store keyed by metric and label set; the HTTP
//! side renders the store on scrape, caching rendered lines per series until
//! the series is updated. Series unseen for `values_timeout` are dropped at
//! flush.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bucky3_core::clock::ClockSource;
use bucky3_core::connector;
use bucky3_core::error::CoreError;
use bucky3_core::resolver::resolve_local;
use bucky3_core::sample::{Metadata, Sample, Scalar, Timestamp};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{DestinationInput, PollOutcome, ShutdownFlag, Worker};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

/// Default exporter port.
pub const DEFAULT_PORT: u16 = 9103;

#[derive(Clone)]
pub struct PrometheusConfig {
    pub local_host: String,
    /// Scrape path with no surrounding slashes, default "metrics".
    pub http_path: String,
    /// Seconds a series survives without updates.
    pub values_timeout: f64,
    /// Rendered lines per write chunk.
    pub chunk_size: usize,
    pub http_timeout: Duration,
}

type SeriesKey = (String, Metadata);

struct SeriesEntry {
    recv_timestamp: Timestamp,
    metric_timestamp: Option<Timestamp>,
    value: Scalar,
    /// Lazily rendered exposition line, invalidated on update.
    line: Option<String>,
}

type SeriesStore = Arc<Mutex<BTreeMap<SeriesKey, SeriesEntry>>>;

pub struct PrometheusExporter {
    name: String,
    input: DestinationInput,
    store: SeriesStore,
    values_timeout: f64,
    clock: ClockSource,
    local_addr: SocketAddr,
    _listener: JoinHandle<()>,
}

impl PrometheusExporter {
    pub fn new(
        name: &str,
        cfg: PrometheusConfig,
        clock: ClockSource,
        input: DestinationInput,
        shutdown: ShutdownFlag,
    ) -> Result<Self, CoreError> {
        let addr = resolve_local(&cfg.local_host, DEFAULT_PORT)?;
        let listener = connector::bind_tcp(addr)?;
        let local_addr = listener.local_addr()?;
        info!(
            "started server at http://{}/{}",
            local_addr, cfg.http_path
        );

        let store: SeriesStore = Arc::new(Mutex::new(BTreeMap::new()));
        let listener_thread = std::thread::Builder::new()
            .name(format!("{name}-http"))
            .spawn({
                let store = Arc::clone(&store);
                let http_path = cfg.http_path.clone();
                let chunk_size = cfg.chunk_size.max(1);
                let http_timeout = cfg.http_timeout;
                move || serve_loop(listener, store, http_path, chunk_size, http_timeout, shutdown)
            })
            .map_err(CoreError::Io)?;

        Ok(Self {
            name: name.to_string(),
            input,
            store,
            values_timeout: cfg.values_timeout,
            clock,
            local_addr,
            _listener: listener_thread,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Worker for PrometheusExporter {
    fn poll(&mut self, wait: Duration) -> PollOutcome {
        let clock = self.clock.clone();
        let store = Arc::clone(&self.store);
        self.input.poll(wait, &clock, move |recv_timestamp, sample| {
            store_sample(&store, recv_timestamp, &sample);
        })
    }

    fn flush(&mut self, timestamp: Timestamp) -> bool {
        let mut store = self.store.lock().unwrap();
        let before = store.len();
        store.retain(|_, entry| timestamp - entry.recv_timestamp <= self.values_timeout);
        if store.len() < before {
            debug!("{} dropped {} stale series", self.name, before - store.len());
        }
        true
    }

    fn self_report(&mut self, timestamp: Timestamp, health: WorkerHealth) {
        let mut fields = health.into_fields();
        fields.insert(
            "metrics_received".to_string(),
            Scalar::Int(self.input.metrics_received() as i64),
        );

        let sample = self_report_sample(&self.name, timestamp, fields);
        let clock = self.clock.clone();
        let store = Arc::clone(&self.store);
        self.input.inject(&clock, sample, move |recv_timestamp, sample| {
            store_sample(&store, recv_timestamp, &sample);
        });
    }
}

/// Index every series of a sample, resetting the cached line.
fn store_sample(store: &SeriesStore, recv_timestamp: Timestamp, sample: &Sample) {
    let mut store = store.lock().unwrap();
    for (value_name, scalar) in sample.values.entries() {
        // Prometheus values are numbers; anything else is skipped.
        if matches!(scalar, Scalar::Str(_)) {
            continue;
        }
        let mut metadata = sample.metadata.clone();
        if let Some(value_name) = value_name {
            metadata.insert("value".to_string(), value_name.to_string());
        }
        store.insert(
            (sample.bucket.clone(), metadata),
            SeriesEntry {
                recv_timestamp,
                metric_timestamp: sample.timestamp,
                value: scalar.clone(),
                line: None,
            },
        );
    }
}

fn serve_loop(
    listener: TcpListener,
    store: SeriesStore,
    http_path: String,
    chunk_size: usize,
    http_timeout: Duration,
    shutdown: ShutdownFlag,
) {
    while !shutdown.is_set() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) =
                    handle_connection(stream, &store, &http_path, chunk_size, http_timeout)
                {
                    debug!("scrape from {peer} failed: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    store: &SeriesStore,
    http_path: &str,
    chunk_size: usize,
    http_timeout: Duration,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(http_timeout))?;
    stream.set_write_timeout(Some(http_timeout))?;

    let mut buf = [0u8; 8192];
    let read = stream.read(&mut buf)?;
    let request = String::from_utf8_lossy(&buf[..read]);

    let mut lines = request.lines();
    let mut head = lines.next().unwrap_or_default().split_whitespace();
    let method = head.next().unwrap_or_default();
    let path = head.next().unwrap_or_default();
    let gzip = lines
        .filter_map(|l| l.split_once(':'))
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("accept-encoding") && value.contains("gzip")
        });

    if method != "GET" || path.trim_matches('/') != http_path {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        return stream.write_all(response.as_bytes());
    }

    let body = {
        let mut store = store.lock().unwrap();
        render_chunks(&mut store, chunk_size).concat()
    };
    let body = if gzip { gzip_body(body.as_bytes())? } else { body.into_bytes() };

    let mut response = String::from("HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\n");
    if gzip {
        response.push_str("Content-Encoding: gzip\r\n");
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    stream.write_all(response.as_bytes())?;
    stream.write_all(&body)
}

fn gzip_body(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// Render the store in chunks of `chunk_size` lines, filling each series'
/// line cache as needed.
fn render_chunks(store: &mut BTreeMap<SeriesKey, SeriesEntry>, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut lines_in_chunk = 0;

    for ((bucket, metadata), entry) in store.iter_mut() {
        let line = entry
            .line
            .get_or_insert_with(|| render_line(bucket, metadata, entry.metric_timestamp, &entry.value));
        current.push_str(line);
        lines_in_chunk += 1;
        if lines_in_chunk == chunk_size {
            chunks.push(std::mem::take(&mut current));
            lines_in_chunk = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// https://prometheus.io/docs/instrumenting/exposition_formats/
///
/// Every line, the last one included, must end with a bare newline or the
/// scraper rejects the whole page.
fn render_line(
    bucket: &str,
    metadata: &Metadata,
    metric_timestamp: Option<Timestamp>,
    value: &Scalar,
) -> String {
    let rendered_value = match value {
        Scalar::Int(v) => v.to_string(),
        Scalar::Float(v) => v.to_string(),
        Scalar::Bool(v) => if *v { "1" } else { "0" }.to_string(),
        Scalar::Str(_) => unreachable!("string series are filtered at ingest"),
    };

    let mut line = String::from(bucket);
    if !metadata.is_empty() {
        let labels: Vec<String> = metadata
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        line.push_str(&format!("{{{}}}", labels.join(",")));
    }
    line.push(' ');
    line.push_str(&rendered_value);
    if let Some(timestamp) = metric_timestamp {
        line.push_str(&format!(" {}", (timestamp * 1000.0) as i64));
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use bucky3_core::sample::metadata;

    use super::*;

    #[test]
    fn line_rendering() {
        let line = render_line(
            "stats_counters",
            &metadata([("name", "gorm"), ("value", "count")]),
            Some(1000.5),
            &Scalar::Float(2.5),
        );
        assert_eq!(line, "stats_counters{name=\"gorm\",value=\"count\"} 2.5 1000500\n");

        let line = render_line("up", &Metadata::new(), None, &Scalar::Bool(true));
        assert_eq!(line, "up 1\n");
    }

    #[test]
    fn chunked_rendering_caches_lines() {
        let mut store = BTreeMap::new();
        for i in 0..5 {
            store.insert(
                ("b".to_string(), metadata([("name", format!("m{i}").as_str())])),
                SeriesEntry {
                    recv_timestamp: 0.0,
                    metric_timestamp: None,
                    value: Scalar::Int(i),
                    line: None,
                },
            );
        }

        let chunks = render_chunks(&mut store, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].lines().count(), 2);
        assert_eq!(chunks[2].lines().count(), 1);
        assert!(store.values().all(|e| e.line.is_some()));

        let page = chunks.concat();
        assert!(page.contains("b{name=\"m3\"} 3\n"));
        assert!(page.ends_with('\n'));
    }
}
