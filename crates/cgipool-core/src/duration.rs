//! Serde helpers for durations expressed as (possibly fractional) seconds.
//!
//! Config files write `"startup_delay": 2` or `settle = 0.2`; in memory the
//! value is always a [`Duration`].

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    from_secs(secs).map_err(serde::de::Error::custom)
}

/// Convert a seconds value to a `Duration`, rejecting negative or
/// non-finite input.
pub fn from_secs(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration: {secs} seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}
