use thiserror::Error;

/// Failures surfaced by the counter store.
///
/// "No data" is never an error: a point lookup that finds nothing
/// returns `Ok(None)` and a range lookup that finds nothing returns
/// an empty series.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend could not be set up: bad credentials, an
    /// unreachable endpoint, a missing table when creation is
    /// disabled, or invalid configuration values.
    #[error("configuration error: {0:#}")]
    Configuration(anyhow::Error),
    /// A transport or protocol failure while talking to the backend.
    #[error("backend request failed: {0:#}")]
    Backend(anyhow::Error),
    #[error("invalid day key {0:?}: expected a YYYYMMDD date")]
    InvalidDayKey(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
