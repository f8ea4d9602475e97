//! A DynamoDB backend for minute-stats.
//!
//! One item per (stat, day): hash key `_id` holds the stat, range key
//! `_date` the day, and each recorded minute is a numeric attribute
//! named for its offset. Increments are `UpdateItem ... ADD`, which
//! DynamoDB applies atomically and which creates the item and the
//! attribute on first use.
//!
//! Requests use the DynamoDB JSON protocol directly over HTTPS and are
//! signed with SigV4.
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use minute_stats::{
    Backend, DATE_FIELD, DayKey, DayRange, FieldValue, MinuteOffset, STAT_FIELD, StoredItem,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

mod credentials;
mod sigv4;

pub use credentials::Credentials;

const SERVICE: &str = "dynamodb";
const TARGET_PREFIX: &str = "DynamoDB_20120810";
const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TABLE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TABLE_ACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize, Debug, Clone)]
pub struct DynamoConfig {
    pub table: String,
    #[serde(default = "DynamoConfig::default_region")]
    pub region: String,
    /// Section of the shared credentials file to use when no keys
    /// are given explicitly or in the environment.
    #[serde(default)]
    pub profile: Option<String>,
    /// Overrides `https://dynamodb.<region>.amazonaws.com`, eg: for
    /// DynamoDB Local.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub create_table: bool,
    #[serde(default = "DynamoConfig::default_capacity")]
    pub read_capacity: u64,
    #[serde(default = "DynamoConfig::default_capacity")]
    pub write_capacity: u64,
    #[serde(
        default = "DynamoConfig::default_request_timeout",
        deserialize_with = "minute_stats::duration::deserialize"
    )]
    pub request_timeout: Duration,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl DynamoConfig {
    fn default_region() -> String {
        "us-east-1".to_string()
    }

    fn default_capacity() -> u64 {
        5
    }

    fn default_request_timeout() -> Duration {
        Duration::from_secs(60)
    }

    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            region: Self::default_region(),
            profile: None,
            endpoint: None,
            create_table: false,
            read_capacity: Self::default_capacity(),
            write_capacity: Self::default_capacity(),
            request_timeout: Self::default_request_timeout(),
            credentials: None,
        }
    }

    fn endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://dynamodb.{}.amazonaws.com", self.region),
        }
    }
}

/// An error reported by the service itself, as opposed to a
/// transport failure.
#[derive(Error, Debug)]
#[error("{operation} failed with status {status}: {kind}: {message}")]
pub struct ServiceError {
    pub operation: String,
    pub status: u16,
    /// eg: `ResourceNotFoundException`
    pub kind: String,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: Option<String>,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

/// The subset of the DynamoDB attribute encoding that we store
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeValue {
    #[serde(rename = "S", skip_serializing_if = "Option::is_none", default)]
    pub s: Option<String>,
    #[serde(rename = "N", skip_serializing_if = "Option::is_none", default)]
    pub n: Option<String>,
}

impl AttributeValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            s: Some(s.into()),
            n: None,
        }
    }

    pub fn number(n: i64) -> Self {
        Self {
            s: None,
            n: Some(n.to_string()),
        }
    }
}

type Item = HashMap<String, AttributeValue>;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TableDescription {
    table_status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeTableOutput {
    table: TableDescription,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateTableOutput {
    table_description: TableDescription,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateItemOutput {
    #[serde(default)]
    attributes: Item,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetItemOutput {
    #[serde(default)]
    item: Option<Item>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryOutput {
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    last_evaluated_key: Option<Item>,
}

fn decode_item(item: Item) -> StoredItem {
    let mut stored = StoredItem::new();
    for (name, value) in item {
        match value {
            AttributeValue { s: Some(s), .. } => stored.insert(name, FieldValue::Str(s)),
            AttributeValue { n: Some(n), .. } => match n.parse::<i64>() {
                Ok(n) => stored.insert(name, FieldValue::Int(n)),
                Err(_) => stored.insert(name, FieldValue::Str(n)),
            },
            _ => {}
        }
    }
    stored
}

fn item_key(stat: &str, day: &DayKey) -> Item {
    let mut key = Item::new();
    key.insert(STAT_FIELD.to_string(), AttributeValue::string(stat));
    key.insert(DATE_FIELD.to_string(), AttributeValue::string(day.as_str()));
    key
}

/// Builds the key condition for a day range. An unbounded range still
/// needs a condition on the sort key; every day key sorts after a
/// single space.
fn key_condition(stat: &str, range: &DayRange) -> (String, BTreeMap<String, AttributeValue>) {
    let mut values = BTreeMap::new();
    values.insert(":id".to_string(), AttributeValue::string(stat));

    let date_condition = match (&range.from, &range.to) {
        (Some(from), Some(to)) => {
            values.insert(":from".to_string(), AttributeValue::string(from.as_str()));
            values.insert(":to".to_string(), AttributeValue::string(to.as_str()));
            "#date BETWEEN :from AND :to"
        }
        (Some(from), None) => {
            values.insert(":from".to_string(), AttributeValue::string(from.as_str()));
            "#date >= :from"
        }
        (None, Some(to)) => {
            values.insert(":to".to_string(), AttributeValue::string(to.as_str()));
            "#date <= :to"
        }
        (None, None) => {
            values.insert(":from".to_string(), AttributeValue::string(" "));
            "#date >= :from"
        }
    };

    (format!("#id = :id AND {date_condition}"), values)
}

pub struct DynamoBackend {
    client: Client,
    url: Url,
    host: String,
    region: String,
    table: String,
    credentials: Credentials,
}

impl DynamoBackend {
    /// Checks that the table exists, creating it when so configured.
    /// Any failure along the way is a configuration error.
    pub async fn open(config: &DynamoConfig) -> minute_stats::Result<Self> {
        Self::open_impl(config)
            .await
            .map_err(minute_stats::Error::Configuration)
    }

    async fn open_impl(config: &DynamoConfig) -> anyhow::Result<Self> {
        let credentials = Credentials::resolve(config.credentials.as_ref(), config.profile.as_deref())?;

        let endpoint = config.endpoint();
        let url = Url::parse(&endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;
        let host = url
            .host_str()
            .with_context(|| format!("endpoint {endpoint} has no host"))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("building http client")?;

        let backend = Self {
            client,
            url,
            host,
            region: config.region.clone(),
            table: config.table.clone(),
            credentials,
        };

        match backend.describe_table().await {
            Ok(status) => {
                tracing::debug!("using existing table {} ({status})", backend.table);
            }
            Err(err) if config.create_table && is_not_found(&err) => {
                backend.create_table(config).await?;
            }
            Err(err) => return Err(err.context(format!("describing table {}", config.table))),
        }

        Ok(backend)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<T> {
        let payload = serde_json::to_string(&body)?;
        let target = format!("{TARGET_PREFIX}.{operation}");

        let mut to_sign = BTreeMap::new();
        to_sign.insert("content-type".to_string(), JSON_CONTENT_TYPE.to_string());
        to_sign.insert("host".to_string(), self.host.clone());
        to_sign.insert("x-amz-target".to_string(), target.clone());
        let signature = sigv4::sign(
            sigv4::SigningRequest {
                method: "POST",
                region: &self.region,
                service: SERVICE,
                headers: to_sign,
                payload: payload.as_bytes(),
                timestamp: Utc::now(),
            },
            &self.credentials,
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert("x-amz-target", HeaderValue::from_str(&target)?);
        headers.insert("x-amz-date", HeaderValue::from_str(&signature.amz_date)?);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&signature.authorization)?);
        if let Some(token) = &self.credentials.session_token {
            headers.insert("x-amz-security-token", HeaderValue::from_str(token)?);
        }

        let response = self
            .client
            .post(self.url.clone())
            .headers(headers)
            .body(payload)
            .send()
            .await
            .with_context(|| format!("sending {operation} to {}", self.url))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading {operation} response"))?;

        if !status.is_success() {
            let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
                kind: None,
                message: Some(text.clone()),
            });
            let kind = body.kind.unwrap_or_default();
            let kind = match kind.rsplit_once('#') {
                Some((_, kind)) => kind.to_string(),
                None => kind,
            };
            return Err(ServiceError {
                operation: operation.to_string(),
                status: status.as_u16(),
                kind,
                message: body.message.unwrap_or_default(),
            }
            .into());
        }

        serde_json::from_str(&text).with_context(|| format!("parsing {operation} response {text}"))
    }

    async fn describe_table(&self) -> anyhow::Result<String> {
        let output: DescribeTableOutput = self
            .call("DescribeTable", json!({"TableName": self.table}))
            .await?;
        Ok(output.table.table_status)
    }

    async fn create_table(&self, config: &DynamoConfig) -> anyhow::Result<()> {
        tracing::info!("creating table {}", self.table);
        let output: CreateTableOutput = self
            .call(
                "CreateTable",
                json!({
                    "TableName": self.table,
                    "AttributeDefinitions": [
                        {"AttributeName": STAT_FIELD, "AttributeType": "S"},
                        {"AttributeName": DATE_FIELD, "AttributeType": "S"},
                    ],
                    "KeySchema": [
                        {"AttributeName": STAT_FIELD, "KeyType": "HASH"},
                        {"AttributeName": DATE_FIELD, "KeyType": "RANGE"},
                    ],
                    "ProvisionedThroughput": {
                        "ReadCapacityUnits": config.read_capacity,
                        "WriteCapacityUnits": config.write_capacity,
                    },
                }),
            )
            .await
            .with_context(|| format!("creating table {}", self.table))?;

        if output.table_description.table_status == "ACTIVE" {
            return Ok(());
        }

        tokio::time::timeout(TABLE_ACTIVE_TIMEOUT, async {
            loop {
                tokio::time::sleep(TABLE_POLL_INTERVAL).await;
                let status = self.describe_table().await?;
                tracing::debug!("waiting for table {} to become ACTIVE: {status}", self.table);
                if status == "ACTIVE" {
                    return anyhow::Ok(());
                }
            }
        })
        .await
        .with_context(|| format!("timed out waiting for table {} to become ACTIVE", self.table))?
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ServiceError>()
        .is_some_and(|err| err.kind == "ResourceNotFoundException")
}

#[async_trait]
impl Backend for DynamoBackend {
    fn name(&self) -> &str {
        "dynamodb"
    }

    async fn atomic_add(
        &self,
        stat: &str,
        day: &DayKey,
        offset: MinuteOffset,
        delta: i64,
    ) -> anyhow::Result<i64> {
        let slot = offset.field_name();
        let output: UpdateItemOutput = self
            .call(
                "UpdateItem",
                json!({
                    "TableName": self.table,
                    "Key": item_key(stat, day),
                    "UpdateExpression": "ADD #slot :delta",
                    "ExpressionAttributeNames": {"#slot": slot},
                    "ExpressionAttributeValues": {":delta": AttributeValue::number(delta)},
                    "ReturnValues": "UPDATED_NEW",
                }),
            )
            .await?;

        output
            .attributes
            .get(&slot)
            .and_then(|v| v.n.as_deref())
            .with_context(|| format!("UpdateItem did not return the new value of {slot}"))?
            .parse()
            .with_context(|| format!("UpdateItem returned a non-integer value for {slot}"))
    }

    async fn get_item(&self, stat: &str, day: &DayKey) -> anyhow::Result<Option<StoredItem>> {
        let output: GetItemOutput = self
            .call(
                "GetItem",
                json!({
                    "TableName": self.table,
                    "Key": item_key(stat, day),
                    "ConsistentRead": true,
                }),
            )
            .await?;
        Ok(output.item.map(decode_item))
    }

    async fn query(&self, stat: &str, range: &DayRange) -> anyhow::Result<Vec<StoredItem>> {
        if range.is_empty() {
            return Ok(vec![]);
        }
        let (condition, values) = key_condition(stat, range);
        let mut items = vec![];
        let mut start_key: Option<Item> = None;

        loop {
            let mut body = json!({
                "TableName": self.table,
                "KeyConditionExpression": condition,
                "ExpressionAttributeNames": {"#id": STAT_FIELD, "#date": DATE_FIELD},
                "ExpressionAttributeValues": values,
                "ConsistentRead": true,
            });
            if let Some(key) = start_key.take() {
                body["ExclusiveStartKey"] = serde_json::to_value(key)?;
            }

            let output: QueryOutput = self.call("Query", body).await?;
            items.extend(output.items.into_iter().map(decode_item));

            match output.last_evaluated_key {
                Some(key) => {
                    tracing::trace!("query for {stat} continues after {key:?}");
                    start_key.replace(key);
                }
                None => break,
            }
        }

        Ok(items)
    }
}
