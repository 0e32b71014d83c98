//! The sample tuple and metadata merging rules.

use std::collections::BTreeMap;

/// Seconds since the Unix epoch, millisecond resolution.
pub type Timestamp = f64;

/// Dimensional tags attached to a sample. Kept sorted so downstream encoders
/// that need deterministic key order (carbon, influxdb, prometheus) get it
/// for free.
pub type Metadata = BTreeMap<String, String>;

/// A single metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    /// Numeric view of the scalar; booleans count as 0/1, strings do not
    /// convert.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Scalar::Str(_) => None,
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

/// Sample payload: either one value or a named set of values. A map expands
/// at the destination into one series per entry, the entry key landing in the
/// metadata under the reserved `value` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Single(Scalar),
    Map(BTreeMap<String, Scalar>),
}

impl Values {
    /// Uniform view for destinations: a map yields its named entries, a
    /// single value yields one unnamed entry.
    pub fn entries(&self) -> Vec<(Option<&str>, &Scalar)> {
        match self {
            Values::Single(v) => vec![(None, v)],
            Values::Map(m) => m.iter().map(|(k, v)| (Some(k.as_str()), v)).collect(),
        }
    }

    pub fn map<I, K, V>(entries: I) -> Values
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        Values::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The unit of flow between workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub bucket: String,
    pub values: Values,
    pub timestamp: Option<Timestamp>,
    pub metadata: Metadata,
}

/// Copy entries of `src` into `dst` without overwriting. Sample-side metadata
/// always wins over worker-level metadata.
pub fn merge_metadata(dst: &mut Metadata, src: &Metadata) {
    for (k, v) in src {
        if !dst.contains_key(k) {
            dst.insert(k.clone(), v.clone());
        }
    }
}

/// Build metadata from string pairs.
pub fn metadata<I, K, V>(entries: I) -> Metadata
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_does_not_overwrite() {
        let mut dst = metadata([("host", "a"), ("name", "cpu")]);
        let src = metadata([("host", "b"), ("env", "prod")]);
        merge_metadata(&mut dst, &src);

        assert_eq!(dst, metadata([("host", "a"), ("name", "cpu"), ("env", "prod")]));
    }

    #[test]
    fn scalar_numeric_view() {
        assert_eq!(Scalar::Int(3).as_f64(), Some(3.0));
        assert_eq!(Scalar::Float(0.5).as_f64(), Some(0.5));
        assert_eq!(Scalar::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Scalar::Bool(false).as_f64(), Some(0.0));
        assert_eq!(Scalar::Str("x".into()).as_f64(), None);
    }
}
