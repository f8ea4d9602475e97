//! Minute resolution counters.
//!
//! Each stat is recorded as one record per day holding 1440 per-minute
//! counters. Writes always land in the minute they happened in; reads
//! fold those minutes into whatever interval the caller wants
//! (hourly, daily, or anything else) over any range of days.
//!
//! ```ignore
//! let store = CounterStore::new(MemoryBackend::new());
//! store.increment("requests").await?;
//! let today = store.get("requests", &DayKey::today()?).await?;
//! let hourly = today.map(|day| day.by_interval(60));
//! ```
//!
//! Storage is delegated to a [`Backend`]; this crate ships an in-memory
//! implementation and the `minute-stats-*` crates provide persistent
//! ones.
pub mod aggregate;
pub mod backend;
pub mod buckets;
pub mod day_key;
pub mod duration;
mod error;
pub mod memory;
mod store;

pub use aggregate::{Aggregated, Aggregation};
pub use backend::{Backend, DayRange};
pub use buckets::{DATE_FIELD, DailyBuckets, DailySeries, FieldValue, STAT_FIELD, StoredItem};
pub use day_key::{DayKey, MINUTES_PER_DAY, MinuteOffset};
pub use error::{Error, Result};
pub use memory::MemoryBackend;
pub use store::CounterStore;
