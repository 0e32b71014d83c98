//! Graphite/Carbon plaintext client over TCP.

use std::io::Write;
use std::time::Duration;

use bucky3_core::clock::ClockSource;
use bucky3_core::connector::TcpConnector;
use bucky3_core::push::PushBuffer;
use bucky3_core::sample::{Metadata, Sample, Scalar, Timestamp};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{DestinationInput, PollOutcome, Worker};

use crate::render_numeric;

/// Default Carbon plaintext port.
pub const DEFAULT_PORT: u16 = 2003;

#[derive(Clone)]
pub struct CarbonConfig {
    pub remote_hosts: Vec<String>,
    /// Metadata keys consumed, in order, as the leading name components.
    pub name_mapping: Vec<String>,
    pub socket_timeout: Option<Duration>,
}

pub struct CarbonClient {
    name: String,
    name_mapping: Vec<String>,
    input: DestinationInput,
    buffer: PushBuffer<String>,
    connector: TcpConnector,
    clock: ClockSource,
}

impl CarbonClient {
    pub fn new(
        name: &str,
        cfg: CarbonConfig,
        clock: ClockSource,
        input: DestinationInput,
        buffer: PushBuffer<String>,
    ) -> Self {
        let connector = TcpConnector::new(cfg.remote_hosts, DEFAULT_PORT, cfg.socket_timeout);
        Self {
            name: name.to_string(),
            name_mapping: cfg.name_mapping,
            input,
            buffer,
            connector,
            clock,
        }
    }
}

impl Worker for CarbonClient {
    fn poll(&mut self, wait: Duration) -> PollOutcome {
        let clock = self.clock.clone();
        let buffer = &mut self.buffer;
        let name_mapping = &self.name_mapping;
        self.input.poll(wait, &clock, |recv_timestamp, sample| {
            encode_sample(buffer, name_mapping, recv_timestamp, &sample);
        })
    }

    fn flush(&mut self, _timestamp: Timestamp) -> bool {
        let connector = &mut self.connector;
        let ok = self.buffer.flush(|chunk| {
            let payload: String = chunk.concat();
            let stream = connector.connect()?;
            stream.write_all(payload.as_bytes())?;
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
        let name_mapping = &self.name_mapping;
        self.input.inject(&clock, sample, |recv_timestamp, sample| {
            encode_sample(buffer, name_mapping, recv_timestamp, &sample);
        });
    }
}

fn encode_sample(
    buffer: &mut PushBuffer<String>,
    name_mapping: &[String],
    recv_timestamp: Timestamp,
    sample: &Sample,
) {
    let timestamp = sample.timestamp.unwrap_or(recv_timestamp) as i64;

    for (value_name, scalar) in sample.values.entries() {
        let Some(rendered) = render_numeric(scalar) else {
            continue;
        };
        let mut metadata = sample.metadata.clone();
        metadata.insert("bucket".to_string(), sample.bucket.clone());
        if let Some(value_name) = value_name {
            metadata.insert("value".to_string(), value_name.to_string());
        }
        if let Some(name) = build_name(name_mapping, metadata) {
            buffer.push(format!("{name} {rendered} {timestamp}\n"));
        }
    }
}

/// Dotted series name: `name_mapping` fields in their configured order, then
/// the remaining metadata values in sorted-key order.
fn build_name(name_mapping: &[String], mut metadata: Metadata) -> Option<String> {
    if metadata.is_empty() {
        return None;
    }
    let mut tokens: Vec<String> = name_mapping
        .iter()
        .filter_map(|key| metadata.remove(key))
        .collect();
    tokens.extend(metadata.into_values());
    Some(
        tokens
            .iter()
            .map(|token| translate_token(token))
            .collect::<Vec<_>>()
            .join("."),
    )
}

/// Graphite splits the namespace on dots and its web UI chokes on globbing
/// characters, so those all become underscores.
fn translate_token(token: &str) -> String {
    token
        .chars()
        .map(|c| match c {
            '/' | '.' | '*' | '[' | ']' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bucky3_core::sample::{Values, metadata};

    use super::*;

    fn encode(name_mapping: &[&str], sample: Sample) -> Vec<String> {
        let mut buffer = PushBuffer::new(100, 10, None, None, Duration::from_secs(1));
        let name_mapping: Vec<String> = name_mapping.iter().map(|s| s.to_string()).collect();
        encode_sample(&mut buffer, &name_mapping, 1500.9, &sample);

        let mut lines = Vec::new();
        buffer.flush(|chunk| {
            lines.extend_from_slice(chunk);
            Ok(Vec::new())
        });
        lines
    }

    #[test]
    fn name_mapping_order_then_sorted_leftovers() {
        let lines = encode(
            &["bucket", "host", "name", "value"],
            Sample {
                bucket: "stats_counters".into(),
                values: Values::map([("count", 5.0), ("rate", 2.5)]),
                timestamp: Some(1000.7),
                metadata: metadata([("host", "box1"), ("name", "gorm"), ("team", "infra")]),
            },
        );

        assert_eq!(
            lines,
            vec![
                "stats_counters.box1.gorm.count.infra 5 1000\n",
                "stats_counters.box1.gorm.rate.infra 2.5 1000\n",
            ]
        );
    }

    #[test]
    fn illegal_characters_translated() {
        let lines = encode(
            &["bucket", "name", "value"],
            Sample {
                bucket: "system_filesystem".into(),
                values: Values::map([("free_bytes", 1024i64)]),
                timestamp: Some(100.0),
                metadata: metadata([("name", "/var/log"), ("device", "/dev/sda[1]")]),
            },
        );

        assert_eq!(
            lines,
            vec!["system_filesystem._var_log.free_bytes._dev_sda_1_ 1024 100\n"]
        );
    }

    #[test]
    fn receive_time_when_sample_has_none() {
        let lines = encode(
            &["bucket", "name", "value"],
            Sample {
                bucket: "b".into(),
                values: Values::map([("v", 1i64)]),
                timestamp: None,
                metadata: metadata([("name", "x")]),
            },
        );
        assert_eq!(lines, vec!["b.x.v 1 1500\n"]);
    }

    #[test]
    fn strings_are_skipped() {
        let lines = encode(
            &["bucket", "name", "value"],
            Sample {
                bucket: "b".into(),
                values: Values::map::<_, _, Scalar>([
                    ("num".to_string(), Scalar::Int(1)),
                    ("txt".to_string(), Scalar::Str("nope".into())),
                ]),
                timestamp: Some(1.0),
                metadata: metadata([("name", "x")]),
            },
        );
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("b.x.num "));
    }
}
