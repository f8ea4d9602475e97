use crate::backend::{Backend, DayRange};
use crate::buckets::{DailyBuckets, DailySeries};
use crate::day_key::{DayKey, key_parts};
use crate::error::{Error, Result};
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;

/// Records per-minute counters for named stats and reads them back
/// a day at a time.
///
/// The store keeps no state of its own beyond a handle on the
/// backend; all counting happens in the backend's atomic add, so a
/// store can be cloned and used from many tasks at once.
#[derive(Clone)]
pub struct CounterStore {
    backend: Arc<dyn Backend>,
}

impl CounterStore {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Counts one occurrence of `stat` in the current minute.
    pub async fn increment(&self, stat: &str) -> Result<i64> {
        self.increment_at(stat, 1, None).await
    }

    /// Adds `n` to `stat` in the current minute.
    pub async fn increment_by(&self, stat: &str, n: i64) -> Result<i64> {
        self.increment_at(stat, n, None).await
    }

    /// Adds `n` to the minute of `stat` that contains `at`, or the
    /// current minute when `at` is `None`, and returns the new total
    /// for that minute. `n` may be negative to correct a count.
    pub async fn increment_at(
        &self,
        stat: &str,
        n: i64,
        at: Option<DateTime<FixedOffset>>,
    ) -> Result<i64> {
        let (day, offset) = key_parts(at)?;
        let count = self
            .backend
            .atomic_add(stat, &day, offset, n)
            .await
            .map_err(Error::Backend)?;
        tracing::debug!(
            backend = self.backend.name(),
            stat,
            %day,
            %offset,
            n,
            count,
            "incremented"
        );
        Ok(count)
    }

    /// The counters of `stat` for `day`, or `None` when nothing was
    /// recorded that day.
    pub async fn get(&self, stat: &str, day: &DayKey) -> Result<Option<DailyBuckets>> {
        let item = self
            .backend
            .get_item(stat, day)
            .await
            .map_err(Error::Backend)?;
        let result = item.as_ref().and_then(DailyBuckets::from_item);
        tracing::debug!(
            backend = self.backend.name(),
            stat,
            %day,
            found = result.is_some(),
            "get"
        );
        Ok(result)
    }

    /// The recorded days of `stat` within `range`, oldest first.
    /// Days without a record are omitted rather than filled in.
    pub async fn get_range(&self, stat: &str, range: DayRange) -> Result<DailySeries> {
        if range.is_empty() {
            return Ok(DailySeries::default());
        }

        let items = self
            .backend
            .query(stat, &range)
            .await
            .map_err(Error::Backend)?;
        let mut days: Vec<DailyBuckets> = items.iter().filter_map(DailyBuckets::from_item).collect();
        if days.len() != items.len() {
            tracing::warn!(
                stat,
                skipped = items.len() - days.len(),
                "ignoring stored items without a valid date"
            );
        }
        // Adapters should already return day order
        days.sort_by(|a, b| a.date.cmp(&b.date));

        tracing::debug!(
            backend = self.backend.name(),
            stat,
            from = ?range.from,
            to = ?range.to,
            days = days.len(),
            "get_range"
        );
        Ok(DailySeries(days))
    }
}
