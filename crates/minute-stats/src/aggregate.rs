//! Re-bucketing of per-minute counters into coarser intervals.
//!
//! Counters are stored at minute granularity and folded into the
//! interval the caller asks for at read time, so no rollup
//! granularity has to be chosen up front.
use crate::buckets::{DailyBuckets, DailySeries};
use crate::day_key::MINUTES_PER_DAY;
use serde::Serialize;

/// A folded sequence of counters and the largest bucket seen
/// while folding.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Aggregated {
    pub values: Vec<i64>,
    pub max: i64,
}

/// How many output buckets a single day folds into
pub fn buckets_per_day(interval: u32) -> usize {
    if interval <= 1 {
        MINUTES_PER_DAY
    } else {
        MINUTES_PER_DAY.div_ceil(interval as usize)
    }
}

fn max_of(values: &[i64]) -> i64 {
    values.iter().copied().fold(0, i64::max)
}

impl DailyBuckets {
    /// Sums the day's slots into buckets of `interval` minutes.
    ///
    /// An interval of 0 or 1 returns the raw slots. Otherwise slot `i`
    /// lands in bucket `i / interval`; when 1440 is not a multiple of
    /// the interval the last bucket covers the remaining slots only.
    /// Sums wrap on overflow.
    pub fn by_interval(&self, interval: u32) -> Aggregated {
        if interval <= 1 {
            let values = self.values.to_vec();
            let max = max_of(&values);
            return Aggregated { values, max };
        }

        let mut values = vec![0i64; buckets_per_day(interval)];
        let interval = interval as usize;
        for (i, v) in self.values.iter().enumerate() {
            let bucket = &mut values[i / interval];
            *bucket = bucket.wrapping_add(*v);
        }

        let max = max_of(&values);
        Aggregated { values, max }
    }
}

impl DailySeries {
    /// Folds each day and concatenates the results in day order.
    pub fn by_interval(&self, interval: u32) -> Aggregated {
        let mut result = Aggregated::default();
        for day in self {
            let folded = day.by_interval(interval);
            result.values.extend(folded.values);
            result.max = result.max.max(folded.max);
        }
        result
    }
}

impl Aggregated {
    /// Keeps only the most recent `period` values.
    /// A period of 0, or one that covers every value, changes nothing.
    pub fn tail(mut self, period: usize) -> Self {
        if period > 0 && period < self.values.len() {
            self.values.drain(..self.values.len() - period);
        }
        self
    }

    /// Drops the zeros after the last non-zero value.
    /// A sequence of only zeros keeps a single zero; an empty
    /// sequence stays empty.
    pub fn trim_trailing_zeros(mut self) -> Self {
        if self.values.is_empty() {
            return self;
        }
        let keep = self
            .values
            .iter()
            .rposition(|&v| v != 0)
            .map(|idx| idx + 1)
            .unwrap_or(1);
        self.values.truncate(keep);
        self
    }

    pub fn sum(&self) -> i64 {
        self.values.iter().fold(0i64, |a, &b| a.wrapping_add(b))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The read-side shaping parameters of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Aggregation {
    /// Minutes per output bucket; 0 and 1 mean per-minute
    pub interval: u32,
    /// Keep only this many trailing buckets; 0 keeps everything
    pub period: usize,
    /// Remove trailing zero buckets
    pub trim: bool,
}

impl Default for Aggregation {
    fn default() -> Self {
        Self {
            interval: 1,
            period: 0,
            trim: false,
        }
    }
}

impl Aggregation {
    fn finish(&self, folded: Aggregated) -> Aggregated {
        let folded = folded.tail(self.period);
        if self.trim {
            folded.trim_trailing_zeros()
        } else {
            folded
        }
    }

    pub fn apply_day(&self, day: &DailyBuckets) -> Aggregated {
        self.finish(day.by_interval(self.interval))
    }

    pub fn apply_series(&self, series: &DailySeries) -> Aggregated {
        self.finish(series.by_interval(self.interval))
    }
}
