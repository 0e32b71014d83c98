//! End-to-end client tests against loopback listeners.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use bucky3_clients::carbon::{CarbonClient, CarbonConfig};
use bucky3_clients::influxdb::{InfluxdbClient, InfluxdbConfig};
use bucky3_clients::prometheus::{PrometheusConfig, PrometheusExporter};
use bucky3_core::clock::ClockSource;
use bucky3_core::pipe::{FanIn, pipe};
use bucky3_core::push::PushBuffer;
use bucky3_core::sample::{Metadata, Sample, Values, metadata};
use bucky3_core::worker::{DestinationInput, ShutdownFlag, Worker};
use flate2::read::GzDecoder;

fn input_with(samples: Vec<Sample>) -> DestinationInput {
    let (tx, rx) = pipe();
    tx.send(samples);
    DestinationInput::new(FanIn::new(vec![rx]), Metadata::new())
}

fn push_buffer<T>() -> PushBuffer<T> {
    PushBuffer::new(1000, 100, None, None, Duration::from_secs(1))
}

fn sample(bucket: &str, name: &str, value: f64) -> Sample {
    Sample {
        bucket: bucket.to_string(),
        values: Values::map([("value", value)]),
        timestamp: Some(1000.0),
        metadata: metadata([("name", name)]),
    }
}

#[test]
fn carbon_ships_lines_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let cfg = CarbonConfig {
        remote_hosts: vec![addr.to_string()],
        name_mapping: vec!["bucket".into(), "name".into(), "value".into()],
        socket_timeout: Some(Duration::from_secs(2)),
    };
    let mut client = CarbonClient::new(
        "carbon",
        cfg,
        ClockSource::System,
        input_with(vec![sample("stats", "gorm", 2.5)]),
        push_buffer(),
    );

    client.poll(Duration::from_millis(200));
    assert!(client.flush(2000.0));

    let (mut accepted, _) = listener.accept().unwrap();
    accepted
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut received = String::new();
    // The client keeps its connection for reuse; read what has arrived.
    let mut buf = [0u8; 1024];
    let n = accepted.read(&mut buf).unwrap();
    received.push_str(&String::from_utf8_lossy(&buf[..n]));

    assert_eq!(received, "stats.gorm.value 2.5 1000\n");
}

#[test]
fn carbon_backs_off_when_unreachable() {
    // A bound-then-dropped listener leaves a port with nothing accepting.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cfg = CarbonConfig {
        remote_hosts: vec![addr.to_string()],
        name_mapping: vec!["bucket".into(), "name".into(), "value".into()],
        socket_timeout: Some(Duration::from_secs(1)),
    };
    let mut client = CarbonClient::new(
        "carbon",
        cfg,
        ClockSource::System,
        input_with(vec![sample("stats", "gorm", 2.5)]),
        push_buffer(),
    );

    client.poll(Duration::from_millis(200));
    assert!(!client.flush(2000.0));
}

#[test]
fn influxdb_sends_datagrams_to_every_host() {
    let receiver_a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let receiver_b = UdpSocket::bind("127.0.0.1:0").unwrap();
    for receiver in [&receiver_a, &receiver_b] {
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
    }

    let cfg = InfluxdbConfig {
        remote_hosts: vec![
            receiver_a.local_addr().unwrap().to_string(),
            receiver_b.local_addr().unwrap().to_string(),
        ],
        socket_timeout: None,
    };
    let mut client = InfluxdbClient::new(
        "influxdb",
        cfg,
        ClockSource::System,
        input_with(vec![sample("stats", "gorm", 2.5)]),
        push_buffer(),
    );

    client.poll(Duration::from_millis(200));
    assert!(client.flush(2000.0));

    let mut buf = [0u8; 1024];
    for receiver in [&receiver_a, &receiver_b] {
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf[..n]),
            "stats,name=gorm value=2.5 1000000000000"
        );
    }
}

fn scrape(addr: std::net::SocketAddr, path: &str, gzip: bool) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let accept = if gzip { "Accept-Encoding: gzip\r\n" } else { "" };
    write!(stream, "GET {path} HTTP/1.1\r\nHost: test\r\n{accept}\r\n").unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    (
        String::from_utf8_lossy(&response[..split]).to_string(),
        response[split + 4..].to_vec(),
    )
}

#[test]
fn prometheus_scrape_roundtrip() {
    let shutdown = ShutdownFlag::new();
    let cfg = PrometheusConfig {
        local_host: "127.0.0.1:0".to_string(),
        http_path: "metrics".to_string(),
        values_timeout: 60.0,
        chunk_size: 2,
        http_timeout: Duration::from_secs(3),
    };
    let mut exporter = PrometheusExporter::new(
        "prometheus",
        cfg,
        ClockSource::System,
        input_with(vec![
            sample("stats", "gorm", 2.5),
            sample("stats", "gurm", 7.0),
        ]),
        shutdown.clone(),
    )
    .unwrap();

    exporter.poll(Duration::from_millis(200));

    let (head, body) = scrape(exporter.local_addr(), "/metrics", false);
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("text/plain; version=0.0.4"));
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("stats{name=\"gorm\",value=\"value\"} 2.5 1000000\n"));
    assert!(body.contains("stats{name=\"gurm\",value=\"value\"} 7 1000000\n"));
    assert!(body.ends_with('\n'));

    // Same content gzipped when the client asks for it.
    let (head, body) = scrape(exporter.local_addr(), "/metrics", true);
    assert!(head.contains("Content-Encoding: gzip"));
    let mut unzipped = String::new();
    GzDecoder::new(&body[..])
        .read_to_string(&mut unzipped)
        .unwrap();
    assert!(unzipped.contains("stats{name=\"gorm\",value=\"value\"} 2.5 1000000\n"));

    // Other paths are not served.
    let (head, _) = scrape(exporter.local_addr(), "/other", false);
    assert!(head.starts_with("HTTP/1.1 404"));

    // Stale series are dropped at flush.
    let now = ClockSource::System.epoch_timestamp();
    assert!(exporter.flush(now + 3600.0));
    let (_, body) = scrape(exporter.local_addr(), "/metrics", false);
    assert!(body.is_empty());

    shutdown.set();
}
