use anyhow::Context;
use clap::{Parser, ValueEnum};
use minute_stats::{Aggregation, CounterStore, DailySeries, DayKey, DayRange, MemoryBackend};
use minute_stats_dynamodb::{Credentials, DynamoBackend, DynamoConfig};
use minute_stats_redis::{RedisBackend, RedisConfig};
use minute_stats_sqlite::{SqliteBackend, SqliteConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod diagnostic_logging;

use diagnostic_logging::{DiagnosticFormat, LoggingConfig};

/// Increment or query minute resolution counters.
///
/// Without any of --query, --date, --from or --to the stat is
/// incremented at the current minute and the new count is printed.
/// Otherwise the stored counters are folded into --interval sized
/// buckets and printed.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Name of the stat to increment or query
    #[arg(long)]
    stat: String,

    /// Read the backend configuration from this TOML file instead
    /// of the backend flags below. The `backend` key selects the
    /// kind, the remaining keys configure it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "dynamodb")]
    backend: BackendKind,

    /// DynamoDB table name
    #[arg(long, default_value = "stats")]
    table: String,

    /// DynamoDB region
    #[arg(long)]
    region: Option<String>,

    /// Profile to use from the shared AWS credentials file
    #[arg(long)]
    profile: Option<String>,

    /// Use this DynamoDB endpoint rather than the regional one
    #[arg(long)]
    endpoint: Option<String>,

    /// Create the DynamoDB table if it does not exist
    #[arg(long)]
    create: bool,

    /// DynamoDB credentials, as key:secret
    #[arg(long)]
    creds: Option<String>,

    #[arg(long, default_value = "stats.db")]
    sqlite_path: String,

    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Query rather than increment
    #[arg(short, long)]
    query: bool,

    /// Fetch only this day. Either YYYYMMDD, or a number of days
    /// before today (0 is today).
    #[arg(long, value_parser = parse_day, conflicts_with_all = ["from", "to"])]
    date: Option<DayKey>,

    /// Start of the range to fetch, inclusive. Same forms as --date.
    #[arg(long, value_parser = parse_day)]
    from: Option<DayKey>,

    /// End of the range to fetch, inclusive. Same forms as --date.
    #[arg(long, value_parser = parse_day)]
    to: Option<DayKey>,

    /// Increment the stat by this amount
    #[arg(short, default_value_t = 1, allow_negative_numbers = true)]
    n: i64,

    /// Width of each output bucket, eg: 1m, 15m, 1h, 1day
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    interval: Duration,

    /// Print only this many of the most recent buckets. 0 prints all.
    #[arg(long, default_value_t = 0)]
    period: usize,

    #[arg(long, value_enum, default_value = "list")]
    format: OutputFormat,

    /// Drop the zero buckets that follow the last non-zero one
    #[arg(long)]
    trim: bool,

    /// How to format diagnostic output. Set STATCTL_LOG to adjust
    /// the log filter.
    #[arg(long, value_enum, default_value = "full")]
    diag_format: DiagnosticFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum BackendKind {
    Dynamodb,
    Sqlite,
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "kebab_case")]
enum OutputFormat {
    /// All buckets as a single comma separated line
    List,
    /// One `{"YYYYMMDD": [...]}` line per day
    Json,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "backend", rename_all = "lowercase")]
enum BackendConfig {
    Dynamodb(DynamoConfig),
    Sqlite(SqliteConfig),
    Redis(RedisConfig),
    Memory,
}

impl BackendConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn from_opt(opt: &Opt) -> anyhow::Result<Self> {
        Ok(match opt.backend {
            BackendKind::Dynamodb => {
                let mut config = DynamoConfig::new(&opt.table);
                if let Some(region) = &opt.region {
                    config.region = region.clone();
                }
                config.profile = opt.profile.clone();
                config.endpoint = opt.endpoint.clone();
                config.create_table = opt.create;
                if let Some(creds) = &opt.creds {
                    config.credentials.replace(Credentials::from_pair(creds)?);
                }
                Self::Dynamodb(config)
            }
            BackendKind::Sqlite => Self::Sqlite(SqliteConfig::new(&opt.sqlite_path)),
            BackendKind::Redis => Self::Redis(RedisConfig::new(&opt.redis_url)),
            BackendKind::Memory => Self::Memory,
        })
    }

    async fn open(&self) -> anyhow::Result<CounterStore> {
        Ok(match self {
            Self::Dynamodb(config) => CounterStore::new(DynamoBackend::open(config).await?),
            Self::Sqlite(config) => CounterStore::new(SqliteBackend::open(config)?),
            Self::Redis(config) => CounterStore::new(RedisBackend::open(config).await?),
            Self::Memory => CounterStore::new(MemoryBackend::new()),
        })
    }
}

/// Accepts `YYYYMMDD`, or up to 4 digits counting days back from today
fn parse_day(s: &str) -> anyhow::Result<DayKey> {
    if !s.is_empty() && s.len() <= 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        let days: u32 = s.parse()?;
        return Ok(DayKey::days_before_today(days)?);
    }
    Ok(s.parse()?)
}

impl Opt {
    fn is_query(&self) -> bool {
        self.query || self.date.is_some() || self.from.is_some() || self.to.is_some()
    }

    fn aggregation(&self) -> anyhow::Result<Aggregation> {
        let minutes = self.interval.as_secs() / 60;
        if minutes == 0 {
            anyhow::bail!(
                "--interval {} is shorter than the one minute resolution of the counters",
                humantime::format_duration(self.interval)
            );
        }
        Ok(Aggregation {
            interval: u32::try_from(minutes).context("--interval is too large")?,
            period: self.period,
            trim: self.trim,
        })
    }

    fn describe_query(&self) -> String {
        match (&self.date, &self.from, &self.to) {
            (Some(date), _, _) => format!("on {date}"),
            (None, Some(from), Some(to)) => format!("from {from} to {to}"),
            (None, Some(from), None) => format!("since {from}"),
            (None, None, Some(to)) => format!("until {to}"),
            (None, None, None) => "on any day".to_string(),
        }
    }

    async fn run(&self) -> anyhow::Result<()> {
        let backend = match &self.config {
            Some(path) => BackendConfig::load(path)?,
            None => BackendConfig::from_opt(self)?,
        };
        let aggregation = self.aggregation()?;
        let store = backend.open().await?;
        tracing::debug!("using {} backend", store.backend_name());

        if !self.is_query() {
            let count = store.increment_by(&self.stat, self.n).await?;
            println!("{count}");
            return Ok(());
        }

        let series = match &self.date {
            Some(date) => store
                .get(&self.stat, date)
                .await?
                .into_iter()
                .collect::<DailySeries>(),
            None => {
                store
                    .get_range(&self.stat, DayRange::new(self.from.clone(), self.to.clone()))
                    .await?
            }
        };

        if series.is_empty() {
            eprintln!("no data for {} {}", self.stat, self.describe_query());
            return Ok(());
        }

        for line in format_series(&series, &aggregation, self.format)? {
            println!("{line}");
        }
        Ok(())
    }
}

fn format_series(
    series: &DailySeries,
    aggregation: &Aggregation,
    format: OutputFormat,
) -> anyhow::Result<Vec<String>> {
    match format {
        OutputFormat::List => {
            let folded = aggregation.apply_series(series);
            Ok(vec![
                folded
                    .values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ])
        }
        OutputFormat::Json => series
            .iter()
            .map(|day| -> anyhow::Result<String> {
                let mut line = serde_json::Map::new();
                line.insert(
                    day.date.to_string(),
                    serde_json::to_value(aggregation.apply_day(day).values)?,
                );
                Ok(serde_json::to_string(&line)?)
            })
            .collect(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    LoggingConfig {
        filter_env_var: "STATCTL_LOG",
        default_filter: "statctl=info,minute_stats=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    opts.run().await
}

#[cfg(test)]
mod test {
    use super::*;
    use minute_stats::DailyBuckets;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn series() -> DailySeries {
        let mut first = DailyBuckets::new(day("20240101"));
        first.values[0] = 1;
        first.values[61] = 2;
        let mut second = DailyBuckets::new(day("20240102"));
        second.values[1439] = 7;
        DailySeries(vec![first, second])
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Opt::command().debug_assert();
    }

    #[test]
    fn day_arguments() {
        k9::assert_equal!(parse_day("20240229").unwrap(), day("20240229"));
        k9::assert_equal!(parse_day("0").unwrap(), DayKey::today().unwrap());
        k9::assert_equal!(
            parse_day("30").unwrap(),
            DayKey::days_before_today(30).unwrap()
        );
        assert!(parse_day("20230229").is_err());
        assert!(parse_day("12345").is_err());
        assert!(parse_day("yesterday").is_err());
        assert!(parse_day("").is_err());
    }

    #[test]
    fn date_excludes_a_range() {
        for range in ["--from", "--to"] {
            let err = Opt::try_parse_from([
                "statctl", "--stat", "hits", "--date", "20240101", range, "20240102",
            ])
            .unwrap_err();
            k9::assert_equal!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
        }
        let opt = Opt::parse_from([
            "statctl", "--stat", "hits", "--from", "20240101", "--to", "20240102",
        ]);
        k9::assert_equal!(opt.describe_query(), "from 20240101 to 20240102");
    }

    #[test]
    fn mode_and_shaping_flags() {
        let opt = Opt::parse_from(["statctl", "--stat", "hits"]);
        assert!(!opt.is_query());
        k9::assert_equal!(opt.n, 1);
        k9::assert_equal!(opt.aggregation().unwrap(), Aggregation::default());

        let opt = Opt::parse_from([
            "statctl", "--stat", "hits", "--from", "20240101", "--interval", "1h", "--period",
            "3", "--trim", "-n", "-2",
        ]);
        assert!(opt.is_query());
        k9::assert_equal!(opt.n, -2);
        k9::assert_equal!(
            opt.aggregation().unwrap(),
            Aggregation {
                interval: 60,
                period: 3,
                trim: true
            }
        );
        k9::assert_equal!(opt.describe_query(), "since 20240101");

        let opt = Opt::parse_from(["statctl", "--stat", "hits", "-q", "--interval", "30s"]);
        assert!(opt.aggregation().is_err());
    }

    #[test]
    fn list_output_folds_all_days() {
        let aggregation = Aggregation {
            interval: 1440,
            ..Aggregation::default()
        };
        k9::assert_equal!(
            format_series(&series(), &aggregation, OutputFormat::List).unwrap(),
            vec!["3,7".to_string()]
        );

        let aggregation = Aggregation {
            interval: 720,
            period: 3,
            trim: false,
        };
        k9::assert_equal!(
            format_series(&series(), &aggregation, OutputFormat::List).unwrap(),
            vec!["0,0,7".to_string()]
        );
    }

    #[test]
    fn json_output_is_per_day() {
        let aggregation = Aggregation {
            interval: 60,
            period: 0,
            trim: true,
        };
        k9::assert_equal!(
            format_series(&series(), &aggregation, OutputFormat::Json).unwrap(),
            vec![
                r#"{"20240101":[1,2]}"#.to_string(),
                format!(r#"{{"20240102":[{}7]}}"#, "0,".repeat(23)),
            ]
        );
    }

    #[test]
    fn backend_config_file() {
        let config: BackendConfig = toml::from_str(
            r#"
backend = "dynamodb"
table = "metrics"
region = "eu-west-1"
create_table = true
request_timeout = "5s"
"#,
        )
        .unwrap();
        match config {
            BackendConfig::Dynamodb(config) => {
                k9::assert_equal!(config.table, "metrics");
                k9::assert_equal!(config.region, "eu-west-1");
                assert!(config.create_table);
                k9::assert_equal!(config.request_timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected {other:?}"),
        }

        let config: BackendConfig = toml::from_str(
            r#"
backend = "sqlite"
path = "/var/lib/stats.db"
busy_timeout = 5
"#,
        )
        .unwrap();
        match config {
            BackendConfig::Sqlite(config) => {
                k9::assert_equal!(config.path, "/var/lib/stats.db");
                k9::assert_equal!(config.busy_timeout, Duration::from_secs(5));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            toml::from_str::<BackendConfig>(r#"backend = "memory""#).unwrap(),
            BackendConfig::Memory
        ));
    }

    #[test]
    fn backend_flags() {
        let opt = Opt::parse_from([
            "statctl", "--stat", "hits", "--table", "t", "--creds", "AKID:secret", "--create",
        ]);
        match BackendConfig::from_opt(&opt).unwrap() {
            BackendConfig::Dynamodb(config) => {
                k9::assert_equal!(config.table, "t");
                assert!(config.create_table);
                k9::assert_equal!(config.credentials, Some(Credentials::new("AKID", "secret")));
            }
            other => panic!("unexpected {other:?}"),
        }

        let opt = Opt::parse_from(["statctl", "--stat", "hits", "--creds", "nocolon"]);
        assert!(BackendConfig::from_opt(&opt).is_err());
    }

    #[tokio::test]
    async fn increments_through_memory_backend() {
        let store = BackendConfig::Memory.open().await.unwrap();
        let when = chrono::DateTime::parse_from_rfc3339("2024-01-01T12:00:00+02:00").unwrap();
        k9::assert_equal!(store.increment_at("hits", 4, Some(when)).await.unwrap(), 4);
        k9::assert_equal!(store.increment_at("hits", 1, Some(when)).await.unwrap(), 5);
        let record = store.get("hits", &day("20240101")).await.unwrap().unwrap();
        k9::assert_equal!(record.values[720], 5);
    }
}
