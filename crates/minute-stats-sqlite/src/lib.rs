//! A SQLite backend for minute-stats.
//!
//! Each counter slot is one row keyed by (stat, day, slot); rows are
//! regrouped into one item per day when read back.
use anyhow::Context;
use async_trait::async_trait;
use minute_stats::{Backend, DayKey, DayRange, FieldValue, MinuteOffset, StoredItem};
use serde::Deserialize;
use sqlite::{Connection, ConnectionThreadSafe, State};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;

#[derive(Deserialize, Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file; `:memory:` for a private,
    /// process local database.
    pub path: String,
    /// How long to wait on a database locked by another
    /// connection before giving up. Default 60 seconds.
    #[serde(
        default = "SqliteConfig::default_busy_timeout",
        deserialize_with = "minute_stats::duration::deserialize"
    )]
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    fn default_busy_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Self::default_busy_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct SqliteBackend {
    db: Arc<ConnectionThreadSafe>,
}

impl SqliteBackend {
    /// Carry out the blocking operation on the database object
    async fn perform<T: Send + 'static>(
        &self,
        mut func: impl FnMut(&ConnectionThreadSafe) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let db = self.db.clone();
        spawn_blocking(move || (func)(&db)).await?
    }

    pub fn open(config: &SqliteConfig) -> minute_stats::Result<Self> {
        Self::open_impl(config).map_err(minute_stats::Error::Configuration)
    }

    fn open_impl(config: &SqliteConfig) -> anyhow::Result<Self> {
        let path = &config.path;
        let mut db = Connection::open_thread_safe(path)
            .with_context(|| format!("failed to open stats database {path}"))?;

        db.set_busy_timeout(config.busy_timeout.as_millis() as usize)?;

        let query = r#"
CREATE TABLE IF NOT EXISTS counters (
    stat text NOT NULL,
    day text NOT NULL,
    slot int NOT NULL,
    value int NOT NULL,
    PRIMARY KEY (stat, day, slot)
);
    "#;

        db.execute(query)
            .with_context(|| format!("creating schema in {path}"))?;
        // Allows readers to proceed while another process is writing
        db.execute("PRAGMA journal_mode = WAL")?;

        tracing::debug!("opened stats database {path}");
        Ok(Self { db: Arc::new(db) })
    }
}

fn add(db: &Connection, stat: &str, day: &str, slot: i64, delta: i64) -> anyhow::Result<i64> {
    // A single statement, so the read of the old value and the
    // write of the new one cannot interleave with another writer.
    let mut stmt = db.prepare(
        "INSERT INTO counters (stat, day, slot, value) VALUES (:stat, :day, :slot, :delta)
         ON CONFLICT (stat, day, slot) DO UPDATE SET value = value + excluded.value
         RETURNING value",
    )?;
    stmt.bind((":stat", stat))?;
    stmt.bind((":day", day))?;
    stmt.bind((":slot", slot))?;
    stmt.bind((":delta", delta))?;

    match stmt.next()? {
        State::Row => Ok(stmt.read::<i64, _>(0usize)?),
        State::Done => anyhow::bail!("upsert of {stat}/{day}/{slot} returned no row"),
    }
}

/// Reads (day, slot, value) rows in day order and groups them into
/// one item per day.
fn select_items(
    db: &Connection,
    stat: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> anyhow::Result<Vec<StoredItem>> {
    let mut sql = "SELECT day, slot, value FROM counters WHERE stat = :stat".to_string();
    if from.is_some() {
        sql.push_str(" AND day >= :from");
    }
    if to.is_some() {
        sql.push_str(" AND day <= :to");
    }
    sql.push_str(" ORDER BY day, slot");

    let mut stmt = db.prepare(&sql)?;
    stmt.bind((":stat", stat))?;
    if let Some(from) = from {
        stmt.bind((":from", from))?;
    }
    if let Some(to) = to {
        stmt.bind((":to", to))?;
    }

    let mut items = vec![];
    let mut current: Option<(String, StoredItem)> = None;
    while stmt.next()? == State::Row {
        let day: String = stmt.read(0usize)?;
        let slot: i64 = stmt.read(1usize)?;
        let value: i64 = stmt.read(2usize)?;

        if current.as_ref().is_none_or(|(d, _)| *d != day) {
            if let Some((_, item)) = current.take() {
                items.push(item);
            }
            let key: DayKey = day
                .parse()
                .with_context(|| format!("stored day {day:?} for {stat}"))?;
            current = Some((day.clone(), StoredItem::for_day(stat, &key)));
        }

        if let (Some((_, item)), Some(offset)) = (
            current.as_mut(),
            usize::try_from(slot).ok().and_then(MinuteOffset::new),
        ) {
            item.insert(offset.field_name(), FieldValue::Int(value));
        }
    }
    if let Some((_, item)) = current {
        items.push(item);
    }

    Ok(items)
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn atomic_add(
        &self,
        stat: &str,
        day: &DayKey,
        offset: MinuteOffset,
        delta: i64,
    ) -> anyhow::Result<i64> {
        let stat = stat.to_string();
        let day = day.to_string();
        let slot = offset.index() as i64;
        self.perform(move |db| add(db, &stat, &day, slot, delta))
            .await
    }

    async fn get_item(&self, stat: &str, day: &DayKey) -> anyhow::Result<Option<StoredItem>> {
        let stat = stat.to_string();
        let day = day.to_string();
        let mut items = self
            .perform(move |db| select_items(db, &stat, Some(day.as_str()), Some(day.as_str())))
            .await?;
        Ok(items.pop())
    }

    async fn query(&self, stat: &str, range: &DayRange) -> anyhow::Result<Vec<StoredItem>> {
        let stat = stat.to_string();
        let from = range.from.as_ref().map(|d| d.to_string());
        let to = range.to.as_ref().map(|d| d.to_string());
        self.perform(move |db| select_items(db, &stat, from.as_deref(), to.as_deref()))
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::DateTime;
    use minute_stats::CounterStore;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn slot(n: usize) -> MinuteOffset {
        MinuteOffset::new(n).unwrap()
    }

    fn memory() -> SqliteBackend {
        SqliteBackend::open(&SqliteConfig::new(":memory:")).unwrap()
    }

    #[tokio::test]
    async fn add_returns_running_total() {
        let db = memory();
        k9::assert_equal!(db.atomic_add("hits", &day("20240101"), slot(90), 5).await.unwrap(), 5);
        k9::assert_equal!(db.atomic_add("hits", &day("20240101"), slot(90), 3).await.unwrap(), 8);
        k9::assert_equal!(db.atomic_add("hits", &day("20240101"), slot(90), -2).await.unwrap(), 6);
        k9::assert_equal!(db.atomic_add("hits", &day("20240101"), slot(91), 1).await.unwrap(), 1);
        k9::assert_equal!(db.atomic_add("misses", &day("20240101"), slot(90), 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_item_shape() {
        let db = memory();
        db.atomic_add("hits", &day("20240101"), slot(0), 2).await.unwrap();
        db.atomic_add("hits", &day("20240101"), slot(1439), 4).await.unwrap();
        db.atomic_add("hits", &day("20240102"), slot(7), 1).await.unwrap();

        let item = db.get_item("hits", &day("20240101")).await.unwrap().unwrap();
        let mut expected = StoredItem::for_day("hits", &day("20240101"));
        expected.set_slot(slot(0), 2);
        expected.set_slot(slot(1439), 4);
        k9::assert_equal!(item, expected);

        assert!(db.get_item("hits", &day("20240103")).await.unwrap().is_none());
        assert!(db.get_item("other", &day("20240101")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_orders_and_bounds() {
        let db = memory();
        for (d, n) in [("20240103", 3), ("20240101", 1), ("20240105", 5), ("20240102", 2)] {
            db.atomic_add("hits", &day(d), slot(10), n).await.unwrap();
            db.atomic_add("hits", &day(d), slot(20), n).await.unwrap();
        }
        db.atomic_add("other", &day("20240102"), slot(10), 100)
            .await
            .unwrap();

        let store = CounterStore::new(db);
        let totals = |range: DayRange| {
            let store = store.clone();
            async move {
                store
                    .get_range("hits", range)
                    .await
                    .unwrap()
                    .iter()
                    .map(|d| (d.date.to_string(), d.total()))
                    .collect::<Vec<_>>()
            }
        };

        k9::assert_equal!(
            totals(DayRange::all()).await,
            vec![
                ("20240101".to_string(), 2),
                ("20240102".to_string(), 4),
                ("20240103".to_string(), 6),
                ("20240105".to_string(), 10),
            ]
        );
        k9::assert_equal!(
            totals(DayRange::between(day("20240102"), day("20240104"))).await,
            vec![("20240102".to_string(), 4), ("20240103".to_string(), 6)]
        );
        k9::assert_equal!(
            totals(DayRange::since(day("20240103"))).await,
            vec![("20240103".to_string(), 6), ("20240105".to_string(), 10)]
        );
        k9::assert_equal!(
            totals(DayRange::until(day("20240101"))).await,
            vec![("20240101".to_string(), 2)]
        );
        k9::assert_equal!(
            totals(DayRange::between(day("20240106"), day("20240110"))).await,
            Vec::<(String, i64)>::new()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_to_one_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");
        let db = SqliteBackend::open(&SqliteConfig::new(path.display().to_string())).unwrap();
        let store = CounterStore::new(db);
        let when = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z").unwrap();

        let mut tasks = vec![];
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    store.increment_at("hits", 1, Some(when)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let record = store.get("hits", &day("20240101")).await.unwrap().unwrap();
        k9::assert_equal!(record.values[600], 200);
    }

    #[tokio::test]
    async fn reopen_keeps_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteConfig::new(dir.path().join("stats.db").display().to_string());
        {
            let db = SqliteBackend::open(&config).unwrap();
            db.atomic_add("hits", &day("20240101"), slot(5), 9).await.unwrap();
        }
        let db = SqliteBackend::open(&config).unwrap();
        k9::assert_equal!(db.atomic_add("hits", &day("20240101"), slot(5), 1).await.unwrap(), 10);
    }

    #[test]
    fn bad_path_is_a_configuration_error() {
        let result = SqliteBackend::open(&SqliteConfig::new("/nonexistent/dir/stats.db"));
        assert!(matches!(result, Err(minute_stats::Error::Configuration(_))));
    }
}
