use crate::day_key::{DayKey, MINUTES_PER_DAY, MinuteOffset};
use std::collections::BTreeMap;

/// Reserved field holding the `YYYYMMDD` day of a stored item
pub const DATE_FIELD: &str = "_date";
/// Reserved field holding the stat name of a stored item
pub const STAT_FIELD: &str = "_id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
}

/// The field map a backend holds for one (stat, day) pair.
///
/// This is the neutral exchange format between the backend
/// adapters and the store; adapters translate their native
/// representation to and from it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredItem {
    fields: BTreeMap<String, FieldValue>,
}

impl StoredItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// An item carrying the reserved stat and date fields
    pub fn for_day(stat: &str, day: &DayKey) -> Self {
        let mut item = Self::new();
        item.insert(STAT_FIELD, FieldValue::Str(stat.to_string()));
        item.insert(DATE_FIELD, FieldValue::Str(day.to_string()));
        item
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn set_slot(&mut self, offset: MinuteOffset, value: i64) {
        self.insert(offset.field_name(), FieldValue::Int(value));
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The 1440 per-minute counters of one stat on one day.
///
/// Slot `i` holds every increment whose minute offset was `i`.
/// Slots that were never incremented are zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DailyBuckets {
    pub date: DayKey,
    pub values: Box<[i64; MINUTES_PER_DAY]>,
}

impl DailyBuckets {
    pub fn new(date: DayKey) -> Self {
        Self {
            date,
            values: Box::new([0; MINUTES_PER_DAY]),
        }
    }

    /// Decodes a stored item.
    ///
    /// Returns `None` when the item has no usable date field: such an
    /// item is treated as absent rather than as a day of zeros.
    /// Fields whose names are not slot numbers are ignored, which
    /// lets metadata live alongside the counters.
    pub fn from_item(item: &StoredItem) -> Option<Self> {
        let date = match item.get(DATE_FIELD)? {
            FieldValue::Str(s) => s.parse::<DayKey>().ok()?,
            FieldValue::Int(_) => return None,
        };

        let mut result = Self::new(date);
        for (name, value) in item.iter() {
            let Some(offset) = MinuteOffset::from_field_name(name) else {
                continue;
            };
            if let FieldValue::Int(n) = value {
                result.values[offset.index()] = *n;
            }
        }
        Some(result)
    }

    pub fn value(&self, offset: MinuteOffset) -> i64 {
        self.values[offset.index()]
    }

    /// Sum of all slots, wrapping on overflow like the interval fold
    pub fn total(&self) -> i64 {
        self.values.iter().fold(0i64, |a, &b| a.wrapping_add(b))
    }
}

/// Records for consecutive days of one stat, oldest first.
/// Days with no record are simply missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DailySeries(pub Vec<DailyBuckets>);

impl DailySeries {
    pub fn days(&self) -> impl Iterator<Item = &DayKey> {
        self.0.iter().map(|d| &d.date)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DailyBuckets> {
        self.0.iter()
    }
}

impl IntoIterator for DailySeries {
    type Item = DailyBuckets;
    type IntoIter = std::vec::IntoIter<DailyBuckets>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DailySeries {
    type Item = &'a DailyBuckets;
    type IntoIter = std::slice::Iter<'a, DailyBuckets>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<DailyBuckets> for DailySeries {
    fn from_iter<I: IntoIterator<Item = DailyBuckets>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
