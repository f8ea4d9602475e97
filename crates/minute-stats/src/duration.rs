//! Deserialization of durations in backend configuration.
//!
//! Accepts integers and floats, which are taken to be seconds, and
//! human readable strings such as `"500ms"` or `"1m 30s"`.
//!
//! ```ignore
//! #[serde(default = "default_timeout", deserialize_with = "minute_stats::duration::deserialize")]
//! timeout: Duration,
//! ```
use serde::Deserializer;
use serde::de::{Error, Visitor};
use std::fmt;
use std::time::Duration;

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("a duration")
    }

    fn visit_u64<E: Error>(self, v: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: Error>(self, v: i64) -> Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom(format!("duration {v} must not be negative")))
    }

    fn visit_f64<E: Error>(self, v: f64) -> Result<Duration, E> {
        Duration::try_from_secs_f64(v).map_err(|err| E::custom(format!("duration {v}: {err}")))
    }

    fn visit_str<E: Error>(self, v: &str) -> Result<Duration, E> {
        humantime::parse_duration(v).map_err(|err| E::custom(format!("duration {v:?}: {err}")))
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    d.deserialize_any(DurationVisitor)
}
