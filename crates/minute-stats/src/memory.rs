//! A process local backend.
//!
//! Useful for tests and for short lived tools that do not need the
//! counters to outlive the process.
use crate::backend::{Backend, DayRange};
use crate::buckets::StoredItem;
use crate::day_key::{DayKey, MinuteOffset};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

type Slots = BTreeMap<MinuteOffset, i64>;

#[derive(Default)]
pub struct MemoryBackend {
    stats: Mutex<HashMap<String, BTreeMap<DayKey, Slots>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn to_item(stat: &str, day: &DayKey, slots: &Slots) -> StoredItem {
    let mut item = StoredItem::for_day(stat, day);
    for (&offset, &value) in slots {
        item.set_slot(offset, value);
    }
    item
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn atomic_add(
        &self,
        stat: &str,
        day: &DayKey,
        offset: MinuteOffset,
        delta: i64,
    ) -> anyhow::Result<i64> {
        let mut stats = self.stats.lock();
        let slot = stats
            .entry(stat.to_string())
            .or_default()
            .entry(day.clone())
            .or_default()
            .entry(offset)
            .or_default();
        *slot = slot
            .checked_add(delta)
            .ok_or_else(|| anyhow::anyhow!("adding {delta} to {stat}/{day}/{offset} overflows"))?;
        Ok(*slot)
    }

    async fn get_item(&self, stat: &str, day: &DayKey) -> anyhow::Result<Option<StoredItem>> {
        let stats = self.stats.lock();
        Ok(stats
            .get(stat)
            .and_then(|days| days.get(day))
            .map(|slots| to_item(stat, day, slots)))
    }

    async fn query(&self, stat: &str, range: &DayRange) -> anyhow::Result<Vec<StoredItem>> {
        if range.is_empty() {
            return Ok(vec![]);
        }
        let stats = self.stats.lock();
        let Some(days) = stats.get(stat) else {
            return Ok(vec![]);
        };
        Ok(days
            .range(range.bounds())
            .map(|(day, slots)| to_item(stat, day, slots))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buckets::{DATE_FIELD, FieldValue};

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn slot(n: usize) -> MinuteOffset {
        MinuteOffset::new(n).unwrap()
    }

    #[tokio::test]
    async fn add_and_fetch() {
        let backend = MemoryBackend::new();
        k9::assert_equal!(backend.atomic_add("a", &day("20240101"), slot(5), 2).await.unwrap(), 2);
        k9::assert_equal!(backend.atomic_add("a", &day("20240101"), slot(5), 3).await.unwrap(), 5);
        k9::assert_equal!(backend.atomic_add("a", &day("20240101"), slot(5), -1).await.unwrap(), 4);

        let item = backend.get_item("a", &day("20240101")).await.unwrap().unwrap();
        k9::assert_equal!(item.get("5"), Some(&FieldValue::Int(4)));
        k9::assert_equal!(
            item.get(DATE_FIELD),
            Some(&FieldValue::Str("20240101".to_string()))
        );

        assert!(backend.get_item("a", &day("20240102")).await.unwrap().is_none());
        assert!(backend.get_item("b", &day("20240101")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overflow_is_an_error() {
        let backend = MemoryBackend::new();
        backend
            .atomic_add("a", &day("20240101"), slot(0), i64::MAX)
            .await
            .unwrap();
        assert!(backend.atomic_add("a", &day("20240101"), slot(0), 1).await.is_err());
    }

    #[tokio::test]
    async fn query_ranges() {
        let backend = MemoryBackend::new();
        for d in ["20240105", "20240101", "20240103"] {
            backend.atomic_add("a", &day(d), slot(1), 1).await.unwrap();
        }
        backend.atomic_add("b", &day("20240102"), slot(1), 1).await.unwrap();

        let dates = |items: Vec<StoredItem>| -> Vec<String> {
            items
                .iter()
                .map(|item| match item.get(DATE_FIELD) {
                    Some(FieldValue::Str(s)) => s.clone(),
                    other => panic!("unexpected {other:?}"),
                })
                .collect()
        };

        k9::assert_equal!(
            dates(backend.query("a", &DayRange::all()).await.unwrap()),
            vec!["20240101", "20240103", "20240105"]
        );
        k9::assert_equal!(
            dates(
                backend
                    .query("a", &DayRange::between(day("20240102"), day("20240105")))
                    .await
                    .unwrap()
            ),
            vec!["20240103", "20240105"]
        );
        k9::assert_equal!(
            dates(backend.query("a", &DayRange::until(day("20240103"))).await.unwrap()),
            vec!["20240101", "20240103"]
        );
        k9::assert_equal!(
            dates(backend.query("a", &DayRange::since(day("20240104"))).await.unwrap()),
            vec!["20240105"]
        );
        assert!(
            backend
                .query("a", &DayRange::between(day("20240105"), day("20240101")))
                .await
                .unwrap()
                .is_empty()
        );
        assert!(backend.query("c", &DayRange::all()).await.unwrap().is_empty());
    }
}
