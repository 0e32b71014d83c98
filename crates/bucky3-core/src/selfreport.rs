//! Internal health metrics every worker can emit through the pipeline.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::sample::{Metadata, Sample, Scalar, Timestamp, Values, metadata};

/// Bucket all self-report samples go to.
pub const SELF_REPORT_BUCKET: &str = "bucky3";

/// Process-level health figures at the time of a self-report.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHealth {
    /// User + system CPU seconds consumed so far.
    pub cpu: f64,
    /// Max resident set size, in kilobytes as reported by the kernel.
    pub memory: i64,
    /// Seconds since the worker started.
    pub uptime: f64,
    pub flush_errors: u64,
}

impl WorkerHealth {
    pub fn measure(started: Instant, flush_errors: u64) -> Self {
        let usage = resource_usage();
        Self {
            cpu: usage.cpu_seconds,
            memory: usage.max_rss,
            uptime: started.elapsed().as_secs_f64(),
            flush_errors,
        }
    }

    /// The base field set shared by every worker kind. Sources and push
    /// destinations extend this with their own counters.
    pub fn into_fields(self) -> BTreeMap<String, Scalar> {
        let mut fields = BTreeMap::new();
        fields.insert("cpu".to_string(), Scalar::Float((self.cpu * 1000.0).round() / 1000.0));
        fields.insert("memory".to_string(), Scalar::Int(self.memory));
        fields.insert(
            "uptime".to_string(),
            Scalar::Float((self.uptime * 1000.0).round() / 1000.0),
        );
        fields.insert("flush_errors".to_string(), Scalar::Int(self.flush_errors as i64));
        fields
    }
}

/// Assemble the self-report sample for a worker.
pub fn self_report_sample(
    worker_name: &str,
    timestamp: Timestamp,
    fields: BTreeMap<String, Scalar>,
) -> Sample {
    let meta: Metadata = metadata([("name", worker_name)]);
    Sample {
        bucket: SELF_REPORT_BUCKET.to_string(),
        values: Values::Map(fields),
        timestamp: Some(timestamp),
        metadata: meta,
    }
}

struct ResourceUsage {
    cpu_seconds: f64,
    max_rss: i64,
}

#[allow(unsafe_code)]
fn resource_usage() -> ResourceUsage {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return ResourceUsage {
            cpu_seconds: 0.0,
            max_rss: 0,
        };
    }

    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1e6;
    ResourceUsage {
        cpu_seconds: seconds(usage.ru_utime) + seconds(usage.ru_stime),
        max_rss: usage.ru_maxrss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_fields_complete() {
        let health = WorkerHealth::measure(Instant::now(), 3);
        let fields = health.into_fields();

        assert!(matches!(fields.get("cpu"), Some(Scalar::Float(v)) if *v >= 0.0));
        assert!(matches!(fields.get("memory"), Some(Scalar::Int(v)) if *v > 0));
        assert!(matches!(fields.get("uptime"), Some(Scalar::Float(_))));
        assert_eq!(fields.get("flush_errors"), Some(&Scalar::Int(3)));
    }

    #[test]
    fn sample_shape() {
        let sample = self_report_sample("statsd", 12.5, BTreeMap::new());
        assert_eq!(sample.bucket, "bucky3");
        assert_eq!(sample.timestamp, Some(12.5));
        assert_eq!(sample.metadata.get("name").unwrap(), "statsd");
    }
}
