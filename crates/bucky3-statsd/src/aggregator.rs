//! Per-key aggregation state: counters, gauges, sets, timers, histograms.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use bucky3_core::sample::{Metadata, Scalar, Timestamp, Values};
use regex::Regex;

use crate::parse::{MetricType, parse_line};

/// Bucket and idle timeout for one metric kind.
#[derive(Debug, Clone)]
pub struct KindConfig {
    pub bucket: String,
    pub timeout: f64,
}

impl KindConfig {
    pub fn new(bucket: &str, timeout: f64) -> Self {
        Self {
            bucket: bucket.to_string(),
            timeout,
        }
    }
}

/// Ordered histogram buckets: name plus exclusive upper bound, `None` being
/// the catch-all.
pub type HistogramBuckets = Vec<(String, Option<f64>)>;

/// Declarative replacement for the old histogram selector callback. The
/// first rule whose matchers all full-match the key's metadata supplies the
/// bucket list for that key.
#[derive(Debug, Clone)]
pub struct HistogramRule {
    matches: Vec<(String, Regex)>,
    buckets: Arc<HistogramBuckets>,
}

impl HistogramRule {
    pub fn new(
        matches: Vec<(String, String)>,
        buckets: HistogramBuckets,
    ) -> Result<Self, regex::Error> {
        let matches = matches
            .into_iter()
            .map(|(key, pattern)| Ok((key, Regex::new(&format!("^(?:{pattern})$"))?)))
            .collect::<Result<_, regex::Error>>()?;
        Ok(Self {
            matches,
            buckets: Arc::new(buckets),
        })
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        self.matches.iter().all(|(key, regex)| {
            metadata.get(key).is_some_and(|value| regex.is_match(value))
        })
    }
}

fn select_bucket(buckets: &HistogramBuckets, value: f64) -> Option<&str> {
    buckets
        .iter()
        .find(|(_, bound)| bound.is_none_or(|b| value < b))
        .map(|(name, _)| name.as_str())
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub counters: KindConfig,
    pub gauges: KindConfig,
    pub sets: KindConfig,
    pub timers: KindConfig,
    pub histograms: KindConfig,
    pub percentile_thresholds: Vec<f64>,
    pub histogram_rules: Vec<HistogramRule>,
    pub timestamp_window: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            counters: KindConfig::new("stats_counters", 60.0),
            gauges: KindConfig::new("stats_gauges", 300.0),
            sets: KindConfig::new("stats_sets", 60.0),
            timers: KindConfig::new("stats_timers", 60.0),
            histograms: KindConfig::new("stats_histograms", 60.0),
            percentile_thresholds: vec![100.0],
            histogram_rules: Vec::new(),
            timestamp_window: 600.0,
        }
    }
}

impl AggregatorConfig {
    /// Sort, deduplicate and clamp the percentile thresholds to (0, 100].
    pub fn normalize(mut self) -> Self {
        let mut thresholds: Vec<f64> = self
            .percentile_thresholds
            .iter()
            .map(|t| (t * 100.0).round() / 100.0)
            .filter(|t| *t > 0.0 && *t <= 100.0)
            .collect();
        thresholds.sort_by(|a, b| a.partial_cmp(b).unwrap());
        thresholds.dedup();
        self.percentile_thresholds = thresholds;
        self
    }
}

struct CounterEntry {
    value: f64,
    cust_timestamp: Option<Timestamp>,
    last_seen: Timestamp,
}

struct GaugeEntry {
    value: f64,
    cust_timestamp: Option<Timestamp>,
    last_seen: Timestamp,
}

struct SetEntry {
    values: HashSet<String>,
    cust_timestamp: Option<Timestamp>,
    last_seen: Timestamp,
}

struct TimerEntry {
    samples: Vec<f64>,
    cust_timestamp: Option<Timestamp>,
    last_seen: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct BucketStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

struct HistogramEntry {
    selector: Arc<HistogramBuckets>,
    buckets: BTreeMap<String, BucketStats>,
    cust_timestamp: Option<Timestamp>,
    last_seen: Timestamp,
}

/// The aggregation state machine. Ingest (`handle_packet`) and flush run
/// concurrently; each kind's map has its own lock, and a flush drains one
/// map into local storage before emitting.
pub struct Aggregator {
    cfg: AggregatorConfig,
    counters: Mutex<HashMap<Metadata, CounterEntry>>,
    gauges: Mutex<HashMap<Metadata, GaugeEntry>>,
    sets: Mutex<HashMap<Metadata, SetEntry>>,
    timers: Mutex<HashMap<Metadata, TimerEntry>>,
    histograms: Mutex<HashMap<Metadata, HistogramEntry>>,
    metrics_received: AtomicU64,
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self {
            cfg: cfg.normalize(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
            metrics_received: AtomicU64::new(0),
        }
    }

    pub fn metrics_received(&self) -> u64 {
        self.metrics_received.load(Relaxed)
    }

    /// Split a datagram payload into lines and aggregate each one.
    pub fn handle_packet(&self, recv_timestamp: Timestamp, payload: &str) {
        for line in payload.lines() {
            let line = line.trim();
            if !line.is_empty() {
                self.handle_line(recv_timestamp, line);
            }
        }
    }

    pub fn handle_line(&self, recv_timestamp: Timestamp, line: &str) {
        let Some(parsed) = parse_line(line, recv_timestamp, self.cfg.timestamp_window) else {
            return;
        };

        // The aggregation key is the metric name plus every remaining tag,
        // the `bucket` override included.
        let mut key = parsed.metadata;
        key.insert("name".to_string(), parsed.name);

        let accepted = match parsed.metric_type {
            MetricType::Counter => self.handle_counter(
                recv_timestamp,
                key,
                parsed.timestamp,
                &parsed.value,
                parsed.rate,
            ),
            MetricType::Gauge => {
                self.handle_gauge(recv_timestamp, key, parsed.timestamp, &parsed.value)
            }
            MetricType::Set => {
                self.handle_set(recv_timestamp, key, parsed.timestamp, parsed.value)
            }
            MetricType::Timer => {
                self.handle_timer(recv_timestamp, key, parsed.timestamp, &parsed.value)
            }
        };
        if accepted {
            self.metrics_received.fetch_add(1, Relaxed);
        }
    }

    fn handle_counter(
        &self,
        recv_timestamp: Timestamp,
        key: Metadata,
        cust_timestamp: Option<Timestamp>,
        value: &str,
        rate: Option<f64>,
    ) -> bool {
        let Ok(value) = value.parse::<f64>() else {
            return false;
        };
        if !value.is_finite() {
            return false;
        }
        // A sampled counter observed a fraction `rate` of the true count.
        let value = match rate {
            None => value,
            Some(rate) if rate > 0.0 && rate <= 1.0 => value / rate,
            Some(_) => return false,
        };

        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key).or_insert(CounterEntry {
            value: 0.0,
            cust_timestamp: None,
            last_seen: recv_timestamp,
        });
        entry.value += value;
        entry.cust_timestamp = cust_timestamp;
        entry.last_seen = recv_timestamp;
        true
    }

    fn handle_gauge(
        &self,
        recv_timestamp: Timestamp,
        key: Metadata,
        cust_timestamp: Option<Timestamp>,
        value: &str,
    ) -> bool {
        let Ok(parsed) = value.parse::<f64>() else {
            return false;
        };
        if !parsed.is_finite() {
            return false;
        }
        let delta = value.starts_with('+') || value.starts_with('-');

        let mut gauges = self.gauges.lock().unwrap();
        match gauges.get_mut(&key) {
            Some(entry) if delta => {
                entry.value += parsed;
                entry.cust_timestamp = cust_timestamp;
                entry.last_seen = recv_timestamp;
            }
            Some(entry) => {
                entry.value = parsed;
                entry.cust_timestamp = cust_timestamp;
                entry.last_seen = recv_timestamp;
            }
            None => {
                gauges.insert(
                    key,
                    GaugeEntry {
                        value: parsed,
                        cust_timestamp,
                        last_seen: recv_timestamp,
                    },
                );
            }
        }
        true
    }

    fn handle_set(
        &self,
        recv_timestamp: Timestamp,
        key: Metadata,
        cust_timestamp: Option<Timestamp>,
        value: String,
    ) -> bool {
        let mut sets = self.sets.lock().unwrap();
        let entry = sets.entry(key).or_insert_with(|| SetEntry {
            values: HashSet::new(),
            cust_timestamp: None,
            last_seen: recv_timestamp,
        });
        entry.values.insert(value);
        entry.cust_timestamp = cust_timestamp;
        entry.last_seen = recv_timestamp;
        true
    }

    fn handle_timer(
        &self,
        recv_timestamp: Timestamp,
        key: Metadata,
        cust_timestamp: Option<Timestamp>,
        value: &str,
    ) -> bool {
        let Ok(value) = value.parse::<f64>() else {
            return false;
        };
        if !value.is_finite() {
            return false;
        }

        {
            let mut timers = self.timers.lock().unwrap();
            let entry = timers.entry(key.clone()).or_insert_with(|| TimerEntry {
                samples: Vec::new(),
                cust_timestamp: None,
                last_seen: recv_timestamp,
            });
            entry.samples.push(value);
            entry.cust_timestamp = cust_timestamp;
            entry.last_seen = recv_timestamp;
        }

        if !self.cfg.histogram_rules.is_empty() {
            self.handle_histogram(recv_timestamp, key, cust_timestamp, value);
        }
        true
    }

    fn handle_histogram(
        &self,
        recv_timestamp: Timestamp,
        key: Metadata,
        cust_timestamp: Option<Timestamp>,
        value: f64,
    ) {
        let mut histograms = self.histograms.lock().unwrap();

        let selector = match histograms.get(&key) {
            Some(entry) => Arc::clone(&entry.selector),
            None => match self.cfg.histogram_rules.iter().find(|r| r.matches(&key)) {
                Some(rule) => Arc::clone(&rule.buckets),
                None => return,
            },
        };

        let Some(bucket_name) = select_bucket(&selector, value) else {
            // Samples matching no bucket stay out of histogram accounting
            // but still count toward the raw timer series.
            return;
        };
        let bucket_name = bucket_name.to_string();

        let entry = histograms.entry(key).or_insert_with(|| HistogramEntry {
            selector,
            buckets: BTreeMap::new(),
            cust_timestamp: None,
            last_seen: recv_timestamp,
        });
        entry
            .buckets
            .entry(bucket_name)
            .and_modify(|stats| {
                stats.count += 1;
                stats.sum += value;
                stats.sum_sq += value * value;
                stats.min = stats.min.min(value);
                stats.max = stats.max.max(value);
            })
            .or_insert(BucketStats {
                count: 1,
                sum: value,
                sum_sq: value * value,
                min: value,
                max: value,
            });
        entry.cust_timestamp = cust_timestamp;
        entry.last_seen = recv_timestamp;
    }

    /// Roll up every kind. `interval` is the elapsed wall clock since the
    /// previous flush, `default_timestamp` is used for records without a
    /// custom timestamp (None defers timestamping to the destination).
    ///
    /// Entries idle past their kind's timeout are evicted; idle entries
    /// still within it emit a zero record so downstream can tell "idle"
    /// from "gone".
    pub fn flush<F>(
        &self,
        system_timestamp: Timestamp,
        interval: f64,
        default_timestamp: Option<Timestamp>,
        mut emit: F,
    ) where
        F: FnMut(&str, Values, Option<Timestamp>, Metadata),
    {
        let interval = interval.max(1e-3);
        self.flush_timers(system_timestamp, interval, default_timestamp, &mut emit);
        self.flush_histograms(system_timestamp, interval, default_timestamp, &mut emit);
        self.flush_counters(system_timestamp, interval, default_timestamp, &mut emit);
        self.flush_gauges(system_timestamp, default_timestamp, &mut emit);
        self.flush_sets(system_timestamp, default_timestamp, &mut emit);
    }

    fn flush_counters<F>(
        &self,
        system_timestamp: Timestamp,
        interval: f64,
        default_timestamp: Option<Timestamp>,
        emit: &mut F,
    ) where
        F: FnMut(&str, Values, Option<Timestamp>, Metadata),
    {
        let timeout = self.cfg.counters.timeout;
        let drained: Vec<(Metadata, f64, Option<Timestamp>)> = {
            let mut counters = self.counters.lock().unwrap();
            counters.retain(|_, e| system_timestamp - e.last_seen <= timeout);
            counters
                .iter_mut()
                .map(|(key, entry)| {
                    let out = (key.clone(), entry.value, entry.cust_timestamp);
                    entry.value = 0.0;
                    entry.cust_timestamp = None;
                    out
                })
                .collect()
        };

        for (key, value, cust_timestamp) in drained {
            emit(
                &self.cfg.counters.bucket,
                Values::map([("count", value), ("rate", value / interval)]),
                cust_timestamp.or(default_timestamp),
                key,
            );
        }
    }

    fn flush_gauges<F>(
        &self,
        system_timestamp: Timestamp,
        default_timestamp: Option<Timestamp>,
        emit: &mut F,
    ) where
        F: FnMut(&str, Values, Option<Timestamp>, Metadata),
    {
        let timeout = self.cfg.gauges.timeout;
        let drained: Vec<(Metadata, f64, Option<Timestamp>)> = {
            let mut gauges = self.gauges.lock().unwrap();
            gauges.retain(|_, e| system_timestamp - e.last_seen <= timeout);
            gauges
                .iter()
                .map(|(key, entry)| (key.clone(), entry.value, entry.cust_timestamp))
                .collect()
        };

        for (key, value, cust_timestamp) in drained {
            emit(
                &self.cfg.gauges.bucket,
                Values::map([("value", value)]),
                cust_timestamp.or(default_timestamp),
                key,
            );
        }
    }

    fn flush_sets<F>(
        &self,
        system_timestamp: Timestamp,
        default_timestamp: Option<Timestamp>,
        emit: &mut F,
    ) where
        F: FnMut(&str, Values, Option<Timestamp>, Metadata),
    {
        let timeout = self.cfg.sets.timeout;
        let drained: Vec<(Metadata, usize, Option<Timestamp>)> = {
            let mut sets = self.sets.lock().unwrap();
            sets.retain(|_, e| system_timestamp - e.last_seen <= timeout);
            sets.iter_mut()
                .map(|(key, entry)| {
                    let out = (key.clone(), entry.values.len(), entry.cust_timestamp);
                    entry.values.clear();
                    entry.cust_timestamp = None;
                    out
                })
                .collect()
        };

        for (key, count, cust_timestamp) in drained {
            emit(
                &self.cfg.sets.bucket,
                Values::map([("count", count as i64)]),
                cust_timestamp.or(default_timestamp),
                key,
            );
        }
    }

    fn flush_timers<F>(
        &self,
        system_timestamp: Timestamp,
        interval: f64,
        default_timestamp: Option<Timestamp>,
        emit: &mut F,
    ) where
        F: FnMut(&str, Values, Option<Timestamp>, Metadata),
    {
        let timeout = self.cfg.timers.timeout;
        let drained: Vec<(Metadata, Vec<f64>, Option<Timestamp>)> = {
            let mut timers = self.timers.lock().unwrap();
            timers.retain(|_, e| system_timestamp - e.last_seen <= timeout);
            timers
                .iter_mut()
                .map(|(key, entry)| {
                    let out = (
                        key.clone(),
                        std::mem::take(&mut entry.samples),
                        entry.cust_timestamp,
                    );
                    entry.cust_timestamp = None;
                    out
                })
                .collect()
        };

        for (key, mut samples, cust_timestamp) in drained {
            let timestamp = cust_timestamp.or(default_timestamp);
            if samples.is_empty() {
                emit(
                    &self.cfg.timers.bucket,
                    Values::map::<_, _, Scalar>([
                        ("count".to_string(), Scalar::Int(0)),
                        ("count_ps".to_string(), Scalar::Float(0.0)),
                    ]),
                    timestamp,
                    key,
                );
                continue;
            }

            samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
            for (threshold, stats) in
                percentile_records(&samples, &self.cfg.percentile_thresholds, interval)
            {
                let mut metadata = key.clone();
                metadata.insert("percentile".to_string(), threshold);
                emit(&self.cfg.timers.bucket, Values::Map(stats), timestamp, metadata);
            }
        }
    }

    fn flush_histograms<F>(
        &self,
        system_timestamp: Timestamp,
        interval: f64,
        default_timestamp: Option<Timestamp>,
        emit: &mut F,
    ) where
        F: FnMut(&str, Values, Option<Timestamp>, Metadata),
    {
        let timeout = self.cfg.histograms.timeout;
        let drained: Vec<(Metadata, BTreeMap<String, BucketStats>, Option<Timestamp>)> = {
            let mut histograms = self.histograms.lock().unwrap();
            histograms.retain(|_, e| system_timestamp - e.last_seen <= timeout);
            histograms
                .iter_mut()
                .map(|(key, entry)| {
                    let out = (
                        key.clone(),
                        std::mem::take(&mut entry.buckets),
                        entry.cust_timestamp,
                    );
                    entry.cust_timestamp = None;
                    out
                })
                .collect()
        };

        for (key, buckets, cust_timestamp) in drained {
            let timestamp = cust_timestamp.or(default_timestamp);
            for (bucket_name, stats) in buckets {
                let mut metadata = key.clone();
                metadata.insert("histogram".to_string(), bucket_name);
                emit(
                    &self.cfg.histograms.bucket,
                    Values::Map(spread_stats(
                        stats.count,
                        stats.sum,
                        stats.sum_sq,
                        stats.min,
                        stats.max,
                        interval,
                    )),
                    timestamp,
                    metadata,
                );
            }
        }
    }
}

/// Statistics for one percentile-truncated prefix of the sorted samples.
fn spread_stats(
    count: u64,
    sum: f64,
    sum_sq: f64,
    lower: f64,
    upper: f64,
    interval: f64,
) -> BTreeMap<String, Scalar> {
    let mean = sum / count as f64;
    let mut stats = BTreeMap::new();
    stats.insert("count".to_string(), Scalar::Int(count as i64));
    stats.insert(
        "count_ps".to_string(),
        Scalar::Float(count as f64 / interval),
    );
    stats.insert("lower".to_string(), Scalar::Float(lower));
    stats.insert("upper".to_string(), Scalar::Float(upper));
    stats.insert("mean".to_string(), Scalar::Float(mean));
    if count > 1 {
        // FP rounding can produce a slightly negative variance, e.g. three
        // samples of 0.003, which would make the stdev complex. Clamp it.
        let n = count as f64;
        let var = ((sum_sq - 2.0 * mean * sum + n * mean * mean) / (n - 1.0)).max(0.0);
        stats.insert("stdev".to_string(), Scalar::Float(var.sqrt()));
    }
    stats
}

/// One left-to-right pass over the sorted samples, emitting statistics at
/// every percentile index boundary. `p == 100` always covers the whole
/// sample set; deriving it from the integer formula would drop the largest
/// sample. Thresholds mapping to index 0 are skipped; thresholds mapping to
/// the same index each produce a record.
fn percentile_records(
    sorted: &[f64],
    thresholds: &[f64],
    interval: f64,
) -> Vec<(String, BTreeMap<String, Scalar>)> {
    let n = sorted.len();
    let mut boundaries = thresholds
        .iter()
        .map(|&t| {
            let idx = if t == 100.0 {
                n
            } else {
                ((t * n as f64) / 100.0).floor() as usize
            };
            (idx, t)
        })
        .filter(|(idx, _)| *idx > 0);

    let mut records = Vec::new();
    let mut next = boundaries.next();
    let (mut count, mut sum, mut sum_sq) = (0u64, 0.0f64, 0.0f64);

    for (i, &x) in sorted.iter().enumerate() {
        count += 1;
        sum += x;
        sum_sq += x * x;
        while let Some((idx, threshold)) = next {
            if i + 1 < idx {
                break;
            }
            records.push((
                format_threshold(threshold),
                spread_stats(count, sum, sum_sq, sorted[0], x, interval),
            ));
            next = boundaries.next();
        }
    }
    records
}

fn format_threshold(threshold: f64) -> String {
    if threshold.fract() == 0.0 {
        format!("{}", threshold as i64)
    } else {
        format!("{threshold}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(stats: &BTreeMap<String, Scalar>, field: &str) -> f64 {
        stats.get(field).unwrap().as_f64().unwrap()
    }

    #[test]
    fn percentile_index_mapping() {
        // 3 samples, p=90 -> idx 2, p=100 -> idx 3 (never derived from the
        // formula, which would drop the largest sample).
        let samples = [100.0, 200.0, 300.0];
        let records = percentile_records(&samples, &[90.0, 100.0], 0.1);
        assert_eq!(records.len(), 2);

        let (label, stats) = &records[0];
        assert_eq!(label, "90");
        assert_eq!(stat(stats, "count"), 2.0);
        assert_eq!(stat(stats, "upper"), 200.0);
        assert_eq!(stat(stats, "lower"), 100.0);
        assert_eq!(stat(stats, "mean"), 150.0);
        assert_eq!(stat(stats, "count_ps"), 20.0);

        let (label, stats) = &records[1];
        assert_eq!(label, "100");
        assert_eq!(stat(stats, "count"), 3.0);
        assert_eq!(stat(stats, "upper"), 300.0);
        assert_eq!(stat(stats, "mean"), 200.0);
        assert!((stat(stats, "stdev") - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_index_thresholds_skipped() {
        // 1 sample, p=50 -> idx 0, skipped; only p=100 emits.
        let records = percentile_records(&[5.0], &[50.0, 100.0], 1.0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "100");
        // Single sample has no stdev.
        assert!(!records[0].1.contains_key("stdev"));
    }

    #[test]
    fn tied_thresholds_both_emit() {
        // 2 samples: p=60 -> idx 1, p=90 -> idx 1. Same numerics, two labels.
        let records = percentile_records(&[1.0, 2.0], &[60.0, 90.0], 1.0);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "60");
        assert_eq!(records[1].0, "90");
        assert_eq!(stat(&records[0].1, "upper"), stat(&records[1].1, "upper"));
    }

    #[test]
    fn negative_variance_clamped() {
        let samples = [0.003, 0.003, 0.003];
        let records = percentile_records(&samples, &[100.0], 1.0);
        let stdev = stat(&records[0].1, "stdev");
        assert_eq!(stdev, 0.0);
    }

    #[test]
    fn order_invariance() {
        let mut a = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let mut b = vec![3.0, 5.0, 2.0, 1.0, 4.0];
        a.sort_by(|x, y| x.partial_cmp(y).unwrap());
        b.sort_by(|x, y| x.partial_cmp(y).unwrap());

        let ra = percentile_records(&a, &[50.0, 90.0, 100.0], 2.0);
        let rb = percentile_records(&b, &[50.0, 90.0, 100.0], 2.0);
        assert_eq!(ra, rb);
    }

    #[test]
    fn bucket_selection_first_match_wins() {
        let buckets: HistogramBuckets = vec![
            ("a".to_string(), Some(100.0)),
            ("b".to_string(), Some(300.0)),
            ("c".to_string(), None),
        ];
        assert_eq!(select_bucket(&buckets, 50.0), Some("a"));
        assert_eq!(select_bucket(&buckets, 100.0), Some("b"));
        assert_eq!(select_bucket(&buckets, 250.0), Some("b"));
        assert_eq!(select_bucket(&buckets, 500.0), Some("c"));

        let bounded: HistogramBuckets = vec![("a".to_string(), Some(10.0))];
        assert_eq!(select_bucket(&bounded, 10.0), None);
    }

    #[test]
    fn threshold_normalization() {
        let cfg = AggregatorConfig {
            percentile_thresholds: vec![99.0, 50.0, 99.0, 0.0, -1.0, 120.0, 100.0],
            ..AggregatorConfig::default()
        }
        .normalize();
        assert_eq!(cfg.percentile_thresholds, vec![50.0, 99.0, 100.0]);
    }

    #[test]
    fn histogram_rule_full_match() {
        let rule = HistogramRule::new(
            vec![("name".to_string(), "resp_.*".to_string())],
            vec![("all".to_string(), None)],
        )
        .unwrap();

        let mut meta = Metadata::new();
        meta.insert("name".to_string(), "resp_time".to_string());
        assert!(rule.matches(&meta));

        // Full match, not substring match.
        meta.insert("name".to_string(), "xresp_time".to_string());
        assert!(!rule.matches(&meta));

        meta.remove("name");
        assert!(!rule.matches(&meta));
    }
}
