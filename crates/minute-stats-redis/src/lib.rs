//! A Redis backend for minute-stats.
//!
//! Each (stat, day) is a hash holding the reserved `_id` and `_date`
//! fields plus one field per recorded minute. A sorted set per stat
//! indexes the days that exist so that ranges can be listed in order
//! with `ZRANGEBYLEX`; every member has score 0 so the set is ordered
//! by the day key text, which is chronological.
//!
//! Keys embed the stat in a `{hash tag}` so that the hashes and the
//! index of one stat share a cluster slot and can be updated in a
//! single `MULTI` transaction.
use anyhow::Context;
use async_trait::async_trait;
use minute_stats::{
    Backend, DATE_FIELD, DayKey, DayRange, FieldValue, MinuteOffset, STAT_FIELD, StoredItem,
};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, IntoConnectionInfo};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;


#[derive(Deserialize, Debug, Clone)]
pub struct RedisConfig {
    /// eg: `redis://127.0.0.1:6379`
    pub url: String,
    /// Prepended to every key. Default `stats`.
    #[serde(default = "RedisConfig::default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Default 10 seconds
    #[serde(
        default = "RedisConfig::default_timeout",
        deserialize_with = "minute_stats::duration::deserialize"
    )]
    pub connect_timeout: Duration,
    /// Default 10 seconds
    #[serde(
        default = "RedisConfig::default_timeout",
        deserialize_with = "minute_stats::duration::deserialize"
    )]
    pub response_timeout: Duration,
}

impl RedisConfig {
    fn default_key_prefix() -> String {
        "stats".to_string()
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: Self::default_key_prefix(),
            username: None,
            password: None,
            connect_timeout: Self::default_timeout(),
            response_timeout: Self::default_timeout(),
        }
    }
}

pub struct RedisBackend {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisBackend {
    /// Connects to the server; failing to reach it is a
    /// configuration error.
    pub async fn open(config: &RedisConfig) -> minute_stats::Result<Self> {
        Self::open_impl(config)
            .await
            .map_err(minute_stats::Error::Configuration)
    }

    async fn open_impl(config: &RedisConfig) -> anyhow::Result<Self> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .with_context(|| format!("parsing redis url {}", config.url))?;
        if let Some(user) = &config.username {
            info.redis.username.replace(user.to_string());
        }
        if let Some(pass) = &config.password {
            info.redis.password.replace(pass.to_string());
        }

        let client = Client::open(info)
            .with_context(|| format!("building redis client for {}", config.url))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connect_timeout)
            .set_response_timeout(config.response_timeout);
        let mut conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .with_context(|| format!("connecting to {}", config.url))?;

        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .with_context(|| format!("ping {}", config.url))?;

        tracing::debug!("connected to redis at {}", config.url);
        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn day_key(&self, stat: &str, day: &str) -> String {
        day_key(&self.key_prefix, stat, day)
    }

    fn index_key(&self, stat: &str) -> String {
        index_key(&self.key_prefix, stat)
    }
}

/// The hash holding one day of a stat. `day` is a day key as stored
/// in the index.
fn day_key(prefix: &str, stat: &str, day: &str) -> String {
    format!("{prefix}:{{{stat}}}:{day}")
}

/// The sorted set of days recorded for a stat
fn index_key(prefix: &str, stat: &str) -> String {
    format!("{prefix}:{{{stat}}}:days")
}

/// Hash fields come back as strings; the reserved ones stay strings
/// and the rest are counters.
fn decode_hash(fields: HashMap<String, String>) -> Option<StoredItem> {
    if fields.is_empty() {
        return None;
    }
    let mut item = StoredItem::new();
    for (name, value) in fields {
        let value = if name == DATE_FIELD || name == STAT_FIELD {
            FieldValue::Str(value)
        } else {
            match value.parse::<i64>() {
                Ok(n) => FieldValue::Int(n),
                Err(_) => FieldValue::Str(value),
            }
        };
        item.insert(name, value);
    }
    Some(item)
}

fn lex_bound(day: Option<&DayKey>, unbounded: &str) -> String {
    match day {
        Some(day) => format!("[{day}"),
        None => unbounded.to_string(),
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn atomic_add(
        &self,
        stat: &str,
        day: &DayKey,
        offset: MinuteOffset,
        delta: i64,
    ) -> anyhow::Result<i64> {
        let key = self.day_key(stat, day.as_str());
        let mut conn = self.conn.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&key)
            .arg(offset.field_name())
            .arg(delta)
            .cmd("HSET")
            .arg(&key)
            .arg(STAT_FIELD)
            .arg(stat)
            .arg(DATE_FIELD)
            .arg(day.as_str())
            .ignore()
            .cmd("ZADD")
            .arg(self.index_key(stat))
            .arg(0)
            .arg(day.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HINCRBY {key} {offset} {delta}"))?;
        Ok(count)
    }

    async fn get_item(&self, stat: &str, day: &DayKey) -> anyhow::Result<Option<StoredItem>> {
        let key = self.day_key(stat, day.as_str());
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HGETALL {key}"))?;
        Ok(decode_hash(fields))
    }

    async fn query(&self, stat: &str, range: &DayRange) -> anyhow::Result<Vec<StoredItem>> {
        if range.is_empty() {
            return Ok(vec![]);
        }
        let index = self.index_key(stat);
        let mut conn = self.conn.clone();
        let days: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(&index)
            .arg(lex_bound(range.from.as_ref(), "-"))
            .arg(lex_bound(range.to.as_ref(), "+"))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("ZRANGEBYLEX {index}"))?;
        if days.is_empty() {
            return Ok(vec![]);
        }

        let mut pipe = redis::pipe();
        for day in &days {
            pipe.cmd("HGETALL").arg(self.day_key(stat, day));
        }
        let hashes: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .with_context(|| format!("HGETALL for {} days of {stat}", days.len()))?;

        Ok(hashes.into_iter().filter_map(decode_hash).collect())
    }
}
