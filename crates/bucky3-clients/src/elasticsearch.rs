//! Elasticsearch bulk-API client.
//!
//! Samples become flat JSON documents (fields + tags + millisecond
//! timestamp) shipped with ndjson bulk requests. Document ids are UUIDv5
//! over the canonical serialization, so a retried push cannot duplicate
//! documents.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use bucky3_core::clock::ClockSource;
use bucky3_core::error::PushError;
use bucky3_core::push::PushBuffer;
use bucky3_core::resolver::CachedResolver;
use bucky3_core::sample::{Sample, Scalar, Timestamp};
use bucky3_core::selfreport::{WorkerHealth, self_report_sample};
use bucky3_core::worker::{DestinationInput, PollOutcome, Worker};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use serde_json::{Value, json};
use tracing::debug;
use ureq::Agent;
use uuid::Uuid;

/// Default Elasticsearch HTTP port.
pub const DEFAULT_PORT: u16 = 9200;

#[derive(Clone)]
pub struct ElasticsearchConfig {
    pub remote_hosts: Vec<String>,
    /// Static index name; the sample bucket when unset.
    pub index_name: Option<String>,
    pub use_compression: bool,
    pub socket_timeout: Option<Duration>,
}

/// One encoded bulk entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub index: String,
    pub json: String,
    pub id: String,
}

pub struct ElasticsearchClient {
    name: String,
    index_name: Option<String>,
    use_compression: bool,
    input: DestinationInput,
    buffer: PushBuffer<Document>,
    resolver: CachedResolver,
    agent: Agent,
    clock: ClockSource,
}

impl ElasticsearchClient {
    pub fn new(
        name: &str,
        cfg: ElasticsearchConfig,
        clock: ClockSource,
        input: DestinationInput,
        buffer: PushBuffer<Document>,
    ) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(cfg.socket_timeout)
            .build()
            .into();

        Self {
            name: name.to_string(),
            index_name: cfg.index_name,
            use_compression: cfg.use_compression,
            input,
            buffer,
            resolver: CachedResolver::new(cfg.remote_hosts, DEFAULT_PORT),
            agent,
            clock,
        }
    }
}

impl Worker for ElasticsearchClient {
    fn poll(&mut self, wait: Duration) -> PollOutcome {
        let clock = self.clock.clone();
        let buffer = &mut self.buffer;
        let index_name = self.index_name.as_deref();
        self.input.poll(wait, &clock, |recv_timestamp, sample| {
            buffer.push(encode_document(index_name, recv_timestamp, &sample));
        })
    }

    fn flush(&mut self, _timestamp: Timestamp) -> bool {
        let resolver = &mut self.resolver;
        let agent = &self.agent;
        let use_compression = self.use_compression;
        let ok = self
            .buffer
            .flush(|chunk| push_chunk(resolver, agent, use_compression, chunk));
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
        let index_name = self.index_name.as_deref();
        self.input.inject(&clock, sample, |recv_timestamp, sample| {
            buffer.push(encode_document(index_name, recv_timestamp, &sample));
        });
    }
}

/// One bulk POST. Hosts come from the cached resolver in shuffled order so
/// pushes spread across the pool between DNS refreshes.
fn push_chunk(
    resolver: &mut CachedResolver,
    agent: &Agent,
    use_compression: bool,
    chunk: &[Document],
) -> Result<Vec<usize>, PushError> {
    let Some(addr) = resolver.resolve_shuffled().into_iter().next() else {
        return Err(PushError::Remote("no resolvable remote host".to_string()));
    };
    let url = format!("http://{addr}/_bulk");

    // https://www.elastic.co/guide/en/elasticsearch/reference/current/docs-bulk.html
    let mut body = Vec::new();
    for doc in chunk {
        let action = json!({"index": {"_index": doc.index, "_id": doc.id}});
        body.extend_from_slice(action.to_string().as_bytes());
        body.push(b'\n');
        body.extend_from_slice(doc.json.as_bytes());
        body.push(b'\n');
    }

    let request = agent
        .post(&url)
        .header("Content-Type", "application/x-ndjson");
    let response = if use_compression {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).map_err(PushError::Connection)?;
        let body = encoder.finish().map_err(PushError::Connection)?;
        request.header("Content-Encoding", "deflate").send(&body[..])
    } else {
        request.send(&body[..])
    };

    let mut response = response.map_err(|e| PushError::Remote(e.to_string()))?;
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|e| PushError::Remote(e.to_string()))?;
    let parsed: Value =
        serde_json::from_str(&text).map_err(|e| PushError::Remote(e.to_string()))?;

    Ok(rejected_items(&parsed))
}

/// Indices of bulk items the server rejected. A response without the
/// `errors` flag set has nothing to report.
fn rejected_items(response: &Value) -> Vec<usize> {
    if response.get("errors").and_then(Value::as_bool) != Some(true) {
        return Vec::new();
    }
    let Some(items) = response.get("items").and_then(Value::as_array) else {
        return Vec::new();
    };
    let rejected: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            item.pointer("/index/status")
                .and_then(Value::as_u64)
                .is_none_or(|status| status >= 300)
        })
        .map(|(i, _)| i)
        .collect();
    if !rejected.is_empty() {
        debug!("bulk response rejected {} documents", rejected.len());
    }
    rejected
}

/// Flatten a sample into one document: values first, metadata filling gaps,
/// plus the millisecond `timestamp` field.
fn encode_document(index_name: Option<&str>, recv_timestamp: Timestamp, sample: &Sample) -> Document {
    let mut doc: BTreeMap<String, Value> = BTreeMap::new();
    for (name, value) in sample.values.entries() {
        let name = name.unwrap_or("value");
        let rendered = match value {
            Scalar::Int(v) => json!(v),
            Scalar::Float(v) => json!(v),
            Scalar::Bool(v) => json!(v),
            Scalar::Str(v) => json!(v),
        };
        doc.insert(name.to_string(), rendered);
    }
    for (key, value) in &sample.metadata {
        doc.entry(key.clone()).or_insert_with(|| json!(value));
    }

    let timestamp = sample.timestamp.unwrap_or(recv_timestamp);
    doc.insert("timestamp".to_string(), json!((timestamp * 1000.0) as i64));

    // BTreeMap keys serialize sorted, which keeps the serialization (and so
    // the document id) stable for identical documents.
    let json = serde_json::to_string(&doc).expect("document serialization");
    let id = Uuid::new_v5(&Uuid::NAMESPACE_DNS, json.as_bytes()).to_string();
    Document {
        index: index_name.unwrap_or(&sample.bucket).to_string(),
        json,
        id,
    }
}

#[cfg(test)]
mod tests {
    use bucky3_core::sample::{Values, metadata};

    use super::*;

    #[test]
    fn document_encoding_is_canonical() {
        let sample = Sample {
            bucket: "stats_counters".into(),
            values: Values::map([("count", 5.0), ("rate", 2.5)]),
            timestamp: Some(1000.5),
            metadata: metadata([("host", "box1"), ("name", "gorm")]),
        };
        let doc = encode_document(None, 2000.0, &sample);

        assert_eq!(doc.index, "stats_counters");
        assert_eq!(
            doc.json,
            r#"{"count":5.0,"host":"box1","name":"gorm","rate":2.5,"timestamp":1000500}"#
        );
        // Same document, same id.
        let again = encode_document(None, 2000.0, &sample);
        assert_eq!(doc.id, again.id);
    }

    #[test]
    fn values_win_over_metadata() {
        let sample = Sample {
            bucket: "b".into(),
            values: Values::map([("host", 1i64)]),
            timestamp: Some(1.0),
            metadata: metadata([("host", "box1")]),
        };
        let doc = encode_document(None, 1.0, &sample);
        assert!(doc.json.contains(r#""host":1"#));
    }

    #[test]
    fn static_index_name() {
        let sample = Sample {
            bucket: "b".into(),
            values: Values::map([("v", 1i64)]),
            timestamp: None,
            metadata: Default::default(),
        };
        let doc = encode_document(Some("metrics-static"), 5.0, &sample);
        assert_eq!(doc.index, "metrics-static");
        // Receive time fills a missing sample timestamp.
        assert!(doc.json.contains(r#""timestamp":5000"#));
    }

    #[test]
    fn rejected_item_indices() {
        let response = json!({
            "errors": true,
            "items": [
                {"index": {"status": 200}},
                {"index": {"status": 429, "error": {"type": "es_rejected_execution_exception"}}},
                {"index": {"status": 201}},
                {"index": {"status": 500}},
            ]
        });
        assert_eq!(rejected_items(&response), vec![1, 3]);

        let clean = json!({"errors": false, "items": [{"index": {"status": 500}}]});
        assert_eq!(rejected_items(&clean), Vec::<usize>::new());
    }
}
