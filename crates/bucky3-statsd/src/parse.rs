//! The DogStatsD line grammar.
//!
//! ```text
//! line := name ":" value "|" type [ "|@" rate ] [ "|#" tags ]
//! type ∈ { c, g, s, ms, h }
//! tag  := ident ( "=" value | ":" value )
//! ```
//!
//! Malformed lines are dropped silently; parse errors are far too frequent
//! in the wild to be worth logging or counting.

use bucky3_core::sample::{Metadata, Timestamp};

/// Custom timestamps larger than this are taken to be milliseconds.
const MILLIS_CUTOFF: f64 = 2147483647.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Set,
    /// Both `ms` and `h`; histogram accounting is a per-key add-on driven by
    /// configured selectors, not a separate wire type.
    Timer,
}

/// A structurally valid line. The value stays a string: gauges need the
/// leading sign to tell deltas from sets, and set members are never numbers.
#[derive(Debug, PartialEq)]
pub struct ParsedLine {
    pub name: String,
    pub value: String,
    pub metric_type: MetricType,
    pub rate: Option<f64>,
    /// Validated custom timestamp from the reserved `timestamp` tag.
    pub timestamp: Option<Timestamp>,
    /// Remaining tags, including a validated `bucket` override when present.
    /// Does not yet include `name`.
    pub metadata: Metadata,
}

/// Parse one line of a datagram. `None` means the line is dropped, either
/// silently ignored (DataDog service checks and events) or malformed.
pub fn parse_line(
    line: &str,
    recv_timestamp: Timestamp,
    timestamp_window: f64,
) -> Option<ParsedLine> {
    // DataDog service check / event packets, ignore them.
    if line.starts_with("sc|") || line.starts_with("_e{") {
        return None;
    }

    let (before, tags) = match line.split_once("|#") {
        Some((before, tags)) => (before, Some(tags)),
        None => (line, None),
    };

    let mut bits = before.split('|');
    let name_value = bits.next()?;
    let type_str = bits.next()?;
    let rate_str = bits.next();
    if bits.next().is_some() {
        return None;
    }

    let (name, value) = name_value.split_once(':')?;
    if !is_identifier(name) || name.starts_with('_') || value.is_empty() {
        return None;
    }

    let metric_type = match type_str {
        "c" => MetricType::Counter,
        "g" => MetricType::Gauge,
        "s" => MetricType::Set,
        "ms" | "h" => MetricType::Timer,
        _ => return None,
    };

    let rate = match rate_str {
        None => None,
        Some(rate_str) => {
            let rate = rate_str.strip_prefix('@')?;
            Some(rate.parse::<f64>().ok().filter(|r| r.is_finite())?)
        }
    };

    let (timestamp, metadata) = match tags {
        None => (None, Metadata::new()),
        Some(tags) => parse_tags(tags, recv_timestamp, timestamp_window)?,
    };

    Some(ParsedLine {
        name: name.to_string(),
        value: value.to_string(),
        metric_type,
        rate,
        timestamp,
        metadata,
    })
}

/// Parse the `|#` tag section. Comma is the only universally illegal
/// character in a tag value; everything else is taken literally.
fn parse_tags(
    tags: &str,
    recv_timestamp: Timestamp,
    timestamp_window: f64,
) -> Option<(Option<Timestamp>, Metadata)> {
    let mut timestamp = None;
    let mut metadata = Metadata::new();

    // Skipping empty bits also allows a terminating comma.
    for tag in tags.split(',').filter(|t| !t.is_empty()) {
        // k=v is the native form, k:v is DataDog's.
        let (key, value) = match tag.split_once('=') {
            Some((k, v)) if !v.is_empty() => (k, v),
            _ => match tag.split_once(':') {
                Some((k, v)) if !v.is_empty() => (k, v),
                _ => return None,
            },
        };
        if !is_identifier(key) || key.starts_with('_') {
            return None;
        }

        match key {
            "timestamp" => {
                let mut cust = value.parse::<f64>().ok().filter(|t| t.is_finite())?;
                // Assume millis not secs past 2^31.
                if cust.abs() > MILLIS_CUTOFF {
                    cust /= 1000.0;
                }
                if (recv_timestamp - cust).abs() > timestamp_window {
                    return None;
                }
                timestamp = Some((cust * 1000.0).round() / 1000.0);
            }
            "bucket" => {
                if !is_identifier(value) {
                    return None;
                }
                metadata.insert(key.to_string(), value.to_string());
            }
            _ => {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }

    Some((timestamp, metadata))
}

/// ASCII identifier: letter or underscore first, then letters, digits and
/// underscores.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucky3_core::sample::metadata;

    const NOW: f64 = 1700000000.0;

    fn parse(line: &str) -> Option<ParsedLine> {
        parse_line(line, NOW, 600.0)
    }

    #[test]
    fn plain_counter() {
        let line = parse("gorm:1.5|c").unwrap();
        assert_eq!(line.name, "gorm");
        assert_eq!(line.value, "1.5");
        assert_eq!(line.metric_type, MetricType::Counter);
        assert_eq!(line.rate, None);
        assert!(line.metadata.is_empty());
    }

    #[test]
    fn all_types() {
        assert_eq!(parse("x:1|c").unwrap().metric_type, MetricType::Counter);
        assert_eq!(parse("x:1|g").unwrap().metric_type, MetricType::Gauge);
        assert_eq!(parse("x:a|s").unwrap().metric_type, MetricType::Set);
        assert_eq!(parse("x:1|ms").unwrap().metric_type, MetricType::Timer);
        assert_eq!(parse("x:1|h").unwrap().metric_type, MetricType::Timer);
        assert!(parse("x:1|d").is_none());
        assert!(parse("x:1|").is_none());
    }

    #[test]
    fn rate_section() {
        assert_eq!(parse("x:1|c|@0.1").unwrap().rate, Some(0.1));
        // Out of range rates parse; kind-specific handling decides their fate.
        assert_eq!(parse("x:1|c|@2").unwrap().rate, Some(2.0));
        assert!(parse("x:1|c|0.1").is_none());
        assert!(parse("x:1|c|@").is_none());
        assert!(parse("x:1|c|@abc").is_none());
        assert!(parse("x:1|c|@0.1|extra").is_none());
    }

    #[test]
    fn name_rules() {
        assert!(parse("_x:1|c").is_none());
        assert!(parse("9x:1|c").is_none());
        assert!(parse("x-y:1|c").is_none());
        assert!(parse("x:|c").is_none());
        assert!(parse(":1|c").is_none());
        assert!(parse("x9_z:1|c").is_some());
    }

    #[test]
    fn tags_both_separators() {
        let line = parse("x:1|c|#env=prod,team:infra").unwrap();
        assert_eq!(line.metadata, metadata([("env", "prod"), ("team", "infra")]));
    }

    #[test]
    fn tag_rules() {
        assert!(parse("x:1|c|#_env=prod").is_none());
        assert!(parse("x:1|c|#env").is_none());
        assert!(parse("x:1|c|#env=").is_none());
        // Terminating comma and empty bits are tolerated.
        assert!(parse("x:1|c|#env=prod,").is_some());
        // Everything but a comma goes literally into the value.
        let line = parse("x:1|c|#path=/var/log,ref:a#b").unwrap();
        assert_eq!(line.metadata, metadata([("path", "/var/log"), ("ref", "a#b")]));
    }

    #[test]
    fn reserved_timestamp_tag() {
        let line = parse(&format!("x:1|c|#timestamp={}", NOW - 100.0)).unwrap();
        assert_eq!(line.timestamp, Some(NOW - 100.0));
        assert!(!line.metadata.contains_key("timestamp"));

        // Milliseconds past 2^31.
        let millis = (NOW - 5.0) * 1000.0;
        let line = parse(&format!("x:1|c|#timestamp={millis}")).unwrap();
        assert_eq!(line.timestamp, Some(NOW - 5.0));

        // Outside the window the whole sample is rejected.
        assert!(parse(&format!("x:1|c|#timestamp={}", NOW - 601.0)).is_none());
        assert!(parse("x:1|c|#timestamp=abc").is_none());
    }

    #[test]
    fn reserved_bucket_tag() {
        let line = parse("x:1|c|#bucket=other_bucket").unwrap();
        assert_eq!(line.metadata.get("bucket").unwrap(), "other_bucket");
        assert!(parse("x:1|c|#bucket=not-an-ident").is_none());
    }

    #[test]
    fn datadog_specials_ignored() {
        assert!(parse("sc|svc|0").is_none());
        assert!(parse("_e{5,4}:title|text").is_none());
    }

    #[test]
    fn packed_values_rejected() {
        // Multi-value packing is not supported; the value must be a single
        // literal the kind handler can parse.
        let line = parse("x:1:2:3|c").unwrap();
        assert_eq!(line.value, "1:2:3");
        assert!(line.value.parse::<f64>().is_err());
    }
}
