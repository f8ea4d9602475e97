//! Mapping between points in time and storage locations.
//!
//! A point in time is addressed by a [`DayKey`], which names the
//! calendar day and is used as the sortable range key of a record,
//! and a [`MinuteOffset`], which names the slot within that day and
//! is used verbatim as the field name of the counter.
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Days, FixedOffset, Local, NaiveDate, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MINUTES_PER_DAY: usize = 24 * 60;

/// An 8 digit `YYYYMMDD` day identifier.
///
/// Day keys are fixed width, so comparing them as plain strings
/// orders them chronologically; the derived `Ord` relies on that.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayKey(String);

impl DayKey {
    /// The day containing `t`, in the time zone that `t` carries.
    /// Pass a `DateTime<Utc>` for UTC day boundaries.
    pub fn for_time<Tz: TimeZone>(t: &DateTime<Tz>) -> Result<Self> {
        Self::from_date(t.date_naive())
    }

    /// Only years 0 through 9999 fit in a day key.
    pub fn from_date(date: NaiveDate) -> Result<Self> {
        if !(0..=9999).contains(&date.year()) {
            return Err(Error::InvalidDayKey(date.to_string()));
        }
        Ok(Self(format!(
            "{:04}{:02}{:02}",
            date.year(),
            date.month(),
            date.day()
        )))
    }

    /// The current day in the local time zone
    pub fn today() -> Result<Self> {
        Self::for_time(&Local::now())
    }

    /// The local day that was `days` days before today.
    pub fn days_before_today(days: u32) -> Result<Self> {
        Local::now()
            .date_naive()
            .checked_sub_days(Days::new(days.into()))
            .ok_or_else(|| Error::InvalidDayKey(format!("{days} days before today")))
            .and_then(Self::from_date)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_date(&self) -> NaiveDate {
        parse_ymd(&self.0).expect("DayKey is only constructed from valid dates")
    }
}

fn parse_ymd(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = s[0..4].parse().ok()?;
    let month = s[4..6].parse().ok()?;
    let day = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

impl FromStr for DayKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match parse_ymd(s) {
            Some(_) => Ok(Self(s.to_string())),
            None => Err(Error::InvalidDayKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for DayKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DayKey> for String {
    fn from(key: DayKey) -> String {
        key.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minutes elapsed since midnight; always in `0..1440`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MinuteOffset(u16);

impl MinuteOffset {
    pub fn for_time<Tz: TimeZone>(t: &DateTime<Tz>) -> Self {
        Self((t.hour() * 60 + t.minute()) as u16)
    }

    pub fn new(offset: usize) -> Option<Self> {
        (offset < MINUTES_PER_DAY).then_some(Self(offset as u16))
    }

    /// Interprets a stored field name as a slot. Anything that is not
    /// a decimal integer in range yields `None`.
    pub fn from_field_name(name: &str) -> Option<Self> {
        name.parse::<usize>().ok().and_then(Self::new)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The storage field name for this slot
    pub fn field_name(self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for MinuteOffset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves an optional timestamp; `None` means "now" in the local zone.
pub fn resolve_time(t: Option<DateTime<FixedOffset>>) -> DateTime<FixedOffset> {
    t.unwrap_or_else(|| Local::now().fixed_offset())
}

/// The day key for `t`, or for today when `t` is `None`.
pub fn day_key(t: Option<DateTime<FixedOffset>>) -> Result<DayKey> {
    DayKey::for_time(&resolve_time(t))
}

/// The storage location for an increment at `t` (now when `None`).
pub fn key_parts(t: Option<DateTime<FixedOffset>>) -> Result<(DayKey, MinuteOffset)> {
    let t = resolve_time(t);
    Ok((DayKey::for_time(&t)?, MinuteOffset::for_time(&t)))
}
