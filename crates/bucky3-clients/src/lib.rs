//! Destination clients shipping samples to remote backends.

#![forbid(unsafe_code)]

pub mod carbon;
pub mod elasticsearch;
pub mod influxdb;
pub mod prometheus;

use bucky3_core::sample::Scalar;

/// Numeric rendering shared by the plaintext protocols: integers bare,
/// floats in their shortest round-trip form, booleans as 0/1. Strings have
/// protocol-specific treatment and return `None` here.
fn render_numeric(value: &Scalar) -> Option<String> {
    match value {
        Scalar::Int(v) => Some(v.to_string()),
        Scalar::Float(v) => Some(v.to_string()),
        Scalar::Bool(v) => Some(if *v { "1" } else { "0" }.to_string()),
        Scalar::Str(_) => None,
    }
}
