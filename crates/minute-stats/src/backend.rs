use crate::buckets::StoredItem;
use crate::day_key::{DayKey, MinuteOffset};
use async_trait::async_trait;
use std::ops::Bound;

/// An inclusive range of days; either end may be left open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DayRange {
    pub from: Option<DayKey>,
    pub to: Option<DayKey>,
}

impl DayRange {
    pub fn new(from: Option<DayKey>, to: Option<DayKey>) -> Self {
        Self { from, to }
    }

    /// Every day ever recorded
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DayKey, to: DayKey) -> Self {
        Self::new(Some(from), Some(to))
    }

    pub fn since(from: DayKey) -> Self {
        Self::new(Some(from), None)
    }

    pub fn until(to: DayKey) -> Self {
        Self::new(None, Some(to))
    }

    /// True when both ends are set and `from` is after `to`,
    /// which no day can satisfy.
    pub fn is_empty(&self) -> bool {
        matches!((&self.from, &self.to), (Some(from), Some(to)) if from > to)
    }

    pub fn contains(&self, day: &DayKey) -> bool {
        self.from.as_ref().is_none_or(|from| day >= from)
            && self.to.as_ref().is_none_or(|to| day <= to)
    }

    /// The range as a pair of bounds, suitable for `BTreeMap::range`.
    /// Callers must check `is_empty` first.
    pub fn bounds(&self) -> (Bound<&DayKey>, Bound<&DayKey>) {
        fn bound(key: &Option<DayKey>) -> Bound<&DayKey> {
            key.as_ref().map_or(Bound::Unbounded, Bound::Included)
        }
        (bound(&self.from), bound(&self.to))
    }
}

/// The narrow interface between the counter store and a
/// persistence engine.
///
/// Items are addressed by a partition key (the stat name) and a
/// sort key (the day). Implementations must apply `atomic_add`
/// atomically on the engine side: two concurrent adds to the same
/// slot must both be reflected in the stored total.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A short label for diagnostics
    fn name(&self) -> &str;

    /// Adds `delta` to the slot, creating the item when it does
    /// not exist yet, and returns the new value of the slot.
    async fn atomic_add(
        &self,
        stat: &str,
        day: &DayKey,
        offset: MinuteOffset,
        delta: i64,
    ) -> anyhow::Result<i64>;

    async fn get_item(&self, stat: &str, day: &DayKey) -> anyhow::Result<Option<StoredItem>>;

    /// Items of `stat` whose day lies within `range`, ordered
    /// by day, oldest first.
    async fn query(&self, stat: &str, range: &DayRange) -> anyhow::Result<Vec<StoredItem>>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    #[test]
    fn range_membership() {
        let d = day("20240102");
        assert!(DayRange::all().contains(&d));
        assert!(DayRange::between(day("20240101"), day("20240103")).contains(&d));
        assert!(DayRange::between(day("20240102"), day("20240102")).contains(&d));
        assert!(!DayRange::between(day("20240103"), day("20240105")).contains(&d));
        assert!(DayRange::since(day("20240102")).contains(&d));
        assert!(!DayRange::since(day("20240103")).contains(&d));
        assert!(DayRange::until(day("20240102")).contains(&d));
        assert!(!DayRange::until(day("20240101")).contains(&d));
    }

    #[test]
    fn inverted_range_is_empty() {
        assert!(DayRange::between(day("20240103"), day("20240101")).is_empty());
        assert!(!DayRange::between(day("20240101"), day("20240101")).is_empty());
        assert!(!DayRange::since(day("20240103")).is_empty());
        assert!(!DayRange::all().is_empty());
    }

    #[test]
    fn bounds_select_from_a_map() {
        use std::collections::BTreeMap;

        let days: BTreeMap<DayKey, i64> = ["20240101", "20240102", "20240103", "20240104"]
            .iter()
            .enumerate()
            .map(|(n, d)| (day(d), n as i64))
            .collect();
        let select = |range: DayRange| -> Vec<i64> {
            days.range(range.bounds()).map(|(_, v)| *v).collect()
        };

        k9::assert_equal!(select(DayRange::all()), vec![0, 1, 2, 3]);
        k9::assert_equal!(
            select(DayRange::between(day("20240102"), day("20240103"))),
            vec![1, 2]
        );
        k9::assert_equal!(select(DayRange::since(day("20240103"))), vec![2, 3]);
        k9::assert_equal!(select(DayRange::until(day("20240101"))), vec![0]);
    }
}
