//! `serde(with = ...)` helpers for representing [`std::time::Duration`] fields as plain
//! seconds on the wire, matching the teacher's `deserialize_seconds_to_duration` pattern.

/// (De)serializes a [`std::time::Duration`] as a whole number of seconds.
pub mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
