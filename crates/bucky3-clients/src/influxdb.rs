//! InfluxDB line-protocol client over UDP.

use std::time::Duration;

use bucky3_core::clock::ClockSource;
use bucky3_core::connector::UdpConnector;
use bucky3_core::push::PushBuffer;
use bucky3_core::resolver::CachedResolver;
use bucky3_core::sample::{Sample, Scalar, Timestamp};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{DestinationInput, PollOutcome, Worker};

/// Default InfluxDB ingest port.
pub const DEFAULT_PORT: u16 = 8086;

#[derive(Clone)]
pub struct InfluxdbConfig {
    pub remote_hosts: Vec<String>,
    pub socket_timeout: Option<Duration>,
}

pub struct InfluxdbClient {
    name: String,
    input: DestinationInput,
    buffer: PushBuffer<String>,
    connector: UdpConnector,
    resolver: CachedResolver,
    clock: ClockSource,
}

impl InfluxdbClient {
    pub fn new(
        name: &str,
        cfg: InfluxdbConfig,
        clock: ClockSource,
        input: DestinationInput,
        buffer: PushBuffer<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            input,
            buffer,
            connector: UdpConnector::new(cfg.socket_timeout),
            resolver: CachedResolver::new(cfg.remote_hosts, DEFAULT_PORT),
            clock,
        }
    }
}

impl Worker for InfluxdbClient {
    fn poll(&mut self, wait: Duration) -> PollOutcome {
        let clock = self.clock.clone();
        let buffer = &mut self.buffer;
        self.input.poll(wait, &clock, |_recv_timestamp, sample| {
            buffer.push(encode_line(&sample));
        })
    }

    fn flush(&mut self, _timestamp: Timestamp) -> bool {
        let connector = &mut self.connector;
        let resolver = &mut self.resolver;
        let ok = self.buffer.flush(|chunk| {
            // One datagram per chunk, kept small by chunk_size to fit an MTU.
            let payload = chunk.join("\n");
            let socket = connector.open()?;
            for addr in resolver.resolve() {
                socket.send_to(payload.as_bytes(), addr)?;
            }
            Ok(Vec::new())
        });
        if !ok {
            self.connector.close();
        }
        self.buffer.trim();
        ok
    }

    fn self_report(&mut self, timestamp: Timestamp, health: WorkerHealth) {
        let mut fields = health.into_fields();
        let counters = self.buffer.counters();
        fields.insert(
            "metrics_received".to_string(),
            Scalar::Int(self.input.metrics_received() as i64),
        );
        fields.insert("metrics_sent".to_string(), Scalar::Int(counters.metrics_sent as i64));
        fields.insert(
            "metrics_rejected".to_string(),
            Scalar::Int(counters.metrics_rejected as i64),
        );
        fields.insert(
            "connection_errors".to_string(),
            Scalar::Int(counters.connection_errors as i64),
        );

        let sample = self_report_sample(&self.name, timestamp, fields);
        let clock = self.clock.clone();
        let buffer = &mut self.buffer;
        self.input.inject(&clock, sample, |_recv_timestamp, sample| {
            buffer.push(encode_line(&sample));
        });
    }
}

/// https://docs.influxdata.com/influxdb/v1.3/write_protocols/line_protocol_tutorial/
fn encode_line(sample: &Sample) -> String {
    let mut measurement = vec![sample.bucket.clone()];
    for (key, value) in &sample.metadata {
        // InfluxDB drops inserts carrying empty tag values.
        if value.is_empty() {
            continue;
        }
        measurement.push(format!("{}={}", escape_tag(key), escape_tag(value)));
    }

    let mut fields = Vec::new();
    for (name, value) in sample.values.entries() {
        let name = name.unwrap_or("value");
        let rendered = match value {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Bool(v) => v.to_string(),
            Scalar::Str(v) => format!("\"{}\"", v.replace('"', "\\\"")),
        };
        fields.push(format!("{name}={rendered}"));
    }

    let mut line = format!("{} {}", measurement.join(","), fields.join(","));
    if let Some(timestamp) = sample.timestamp {
        // Only the nanosecond precision plays well with the line protocol.
        line.push_str(&format!(" {}", (timestamp * 1e9) as i64));
    }
    line
}

fn escape_tag(token: &str) -> String {
    token
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

#[cfg(test)]
mod tests {
    use bucky3_core::sample::{Values, metadata};

    use super::*;

    #[test]
    fn line_format() {
        let line = encode_line(&Sample {
            bucket: "stats_counters".into(),
            values: Values::map([("count", 5.0), ("rate", 2.5)]),
            timestamp: Some(1000.5),
            metadata: metadata([("host", "box1"), ("name", "gorm")]),
        });
        assert_eq!(
            line,
            "stats_counters,host=box1,name=gorm count=5,rate=2.5 1000500000000"
        );
    }

    #[test]
    fn tag_escaping_and_empty_values() {
        let line = encode_line(&Sample {
            bucket: "b".into(),
            values: Values::map([("v", 1i64)]),
            timestamp: None,
            metadata: metadata([("a b", "x,y=z"), ("empty", ""), ("name", "n")]),
        });
        assert_eq!(line, "b,a\\ b=x\\,y\\=z,name=n v=1");
    }

    #[test]
    fn field_types() {
        let line = encode_line(&Sample {
            bucket: "b".into(),
            values: Values::map::<_, _, Scalar>([
                ("f".to_string(), Scalar::Float(0.5)),
                ("i".to_string(), Scalar::Int(7)),
                ("ok".to_string(), Scalar::Bool(true)),
                ("s".to_string(), Scalar::Str("say \"hi\"".into())),
            ]),
            timestamp: None,
            metadata: metadata([("name", "n")]),
        });
        assert_eq!(line, "b,name=n f=0.5,i=7,ok=true,s=\"say \\\"hi\\\"\"");
    }

    #[test]
    fn single_value_uses_value_field() {
        let line = encode_line(&Sample {
            bucket: "b".into(),
            values: Values::Single(Scalar::Int(3)),
            timestamp: None,
            metadata: Default::default(),
        });
        assert_eq!(line, "b value=3");
    }
}
