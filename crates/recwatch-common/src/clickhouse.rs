//! ClickHouse-backed collection gateway.
//!
//! A "collection" maps to a ClickHouse table inside the configured database.
//! Rows are pulled as one `JSONEachRow` string per row so the watcher can
//! treat them as schemaless records.

use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Deserialize;
use tracing::debug;

use crate::gateway::{validate_identifier, CollectionGateway, Record, StoreError};

/// Configuration for the ClickHouse client.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse HTTP URL (e.g., "http://localhost:8123").
    pub url: String,
    /// Database name.
    pub database: String,
    /// Username (optional).
    pub user: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: None,
            password: None,
        }
    }
}

/// ClickHouse client wrapper shared by every watched collection.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    /// Creates a new ClickHouse client with the given configuration.
    pub fn new(config: ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        Self { client, config }
    }

    /// Returns the configuration this client was built from.
    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// Tests the connection by running a simple query.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Creates a gateway for one table of the configured database.
    pub fn gateway(&self, table: &str) -> Result<ClickHouseGateway, StoreError> {
        let database = validate_identifier(&self.config.database)?;
        let table = validate_identifier(table)?;

        Ok(ClickHouseGateway {
            client: self.client.clone(),
            table: table.to_string(),
            qualified: format!("`{database}`.`{table}`"),
            order_by: None,
        })
    }

    /// Looks up the sorting key of a table in the configured database.
    ///
    /// Returns `None` for tables without one (e.g. `Log` engines or
    /// `ORDER BY tuple()`).
    pub async fn sorting_key(&self, table: &str) -> Result<Option<String>, StoreError> {
        let table = validate_identifier(table)?;
        let keys = self
            .client
            .query("SELECT sorting_key FROM system.tables WHERE database = ? AND name = ?")
            .bind(&self.config.database)
            .bind(table)
            .fetch_all::<String>()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(keys.into_iter().next().filter(|key| !key.trim().is_empty()))
    }
}

/// Gateway over a single ClickHouse table.
#[derive(Clone)]
pub struct ClickHouseGateway {
    client: Client,
    table: String,
    qualified: String,
    order_by: Option<String>,
}

#[derive(Debug, Row, Deserialize)]
struct HighWaterRow {
    total: u64,
    high: u64,
}

impl ClickHouseGateway {
    /// Orders `fetch_all` by `expr`, normally the table's sorting key.
    ///
    /// Without an order ClickHouse may return rows from different parts in
    /// any order, which breaks positional new-record detection.
    pub fn with_order_by(mut self, expr: impl Into<String>) -> Self {
        self.order_by = Some(expr.into());
        self
    }

    /// Fully qualified, quoted table name used in queries.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    fn fetch_all_sql(&self) -> String {
        let mut sql = format!(
            "SELECT formatRowNoNewline('JSONEachRow', *) FROM {}",
            self.qualified
        );
        if let Some(expr) = &self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(expr);
        }
        sql
    }

    async fn fetch_json_rows(&self, sql: &str, mark: Option<u64>) -> Result<Vec<Record>, StoreError> {
        let mut query = self.client.query(sql);
        if let Some(mark) = mark {
            query = query.bind(mark);
        }

        let rows = query
            .fetch_all::<String>()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        debug!("Fetched {} rows from {}", rows.len(), self.qualified);
        decode_rows(&rows)
    }
}

#[async_trait]
impl CollectionGateway for ClickHouseGateway {
    fn collection(&self) -> &str {
        &self.table
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let sql = format!("SELECT count() FROM {}", self.qualified);
        self.client
            .query(&sql)
            .fetch_one::<u64>()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn fetch_all(&self) -> Result<Vec<Record>, StoreError> {
        let sql = self.fetch_all_sql();
        self.fetch_json_rows(&sql, None).await
    }

    async fn fetch_after(&self, column: &str, mark: u64) -> Result<Vec<Record>, StoreError> {
        let column = validate_identifier(column)?;
        let sql = format!(
            "SELECT formatRowNoNewline('JSONEachRow', *) FROM {} \
             WHERE toUInt64(`{column}`) > ? ORDER BY toUInt64(`{column}`)",
            self.qualified
        );
        self.fetch_json_rows(&sql, Some(mark)).await
    }

    async fn max_value(&self, column: &str) -> Result<Option<u64>, StoreError> {
        let column = validate_identifier(column)?;
        let sql = format!(
            "SELECT count() AS total, max(toUInt64(`{column}`)) AS high FROM {}",
            self.qualified
        );
        let row = self
            .client
            .query(&sql)
            .fetch_one::<HighWaterRow>()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok((row.total > 0).then_some(row.high))
    }
}

/// Parses `JSONEachRow` lines into records.
fn decode_rows(rows: &[String]) -> Result<Vec<Record>, StoreError> {
    rows.iter()
        .map(|line| {
            serde_json::from_str::<Record>(line).map_err(|e| StoreError::Decode(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClickHouseConfig::default();
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.database, "default");
        assert!(config.user.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_gateway_qualified_name() {
        let client = ClickHouseClient::new(ClickHouseConfig {
            database: "analytics".to_string(),
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        });

        let gateway = client.gateway("users").unwrap();
        assert_eq!(gateway.collection(), "users");
        assert_eq!(gateway.qualified_name(), "`analytics`.`users`");
    }

    #[test]
    fn test_fetch_all_sql_order() {
        let client = ClickHouseClient::new(ClickHouseConfig::default());

        let unordered = client.gateway("events").unwrap();
        assert_eq!(unordered.order_by(), None);
        assert_eq!(
            unordered.fetch_all_sql(),
            "SELECT formatRowNoNewline('JSONEachRow', *) FROM `default`.`events`"
        );

        let ordered = client.gateway("events").unwrap().with_order_by("ts, id");
        assert_eq!(ordered.order_by(), Some("ts, id"));
        assert_eq!(
            ordered.fetch_all_sql(),
            "SELECT formatRowNoNewline('JSONEachRow', *) FROM `default`.`events` ORDER BY ts, id"
        );
    }

    #[test]
    fn test_gateway_rejects_bad_names() {
        let client = ClickHouseClient::new(ClickHouseConfig::default());
        assert!(matches!(
            client.gateway("users`; DROP"),
            Err(StoreError::InvalidIdentifier(_))
        ));

        let client = ClickHouseClient::new(ClickHouseConfig {
            database: "my-db".to_string(),
            ..Default::default()
        });
        assert!(client.gateway("users").is_err());
    }

    #[test]
    fn test_decode_rows() {
        let rows = vec![
            r#"{"id":"1","name":"alice"}"#.to_string(),
            r#"{"id":"2","name":"bob","tags":["a","b"]}"#.to_string(),
        ];

        let records = decode_rows(&rows).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "alice");
        assert_eq!(records[1]["tags"][1], "b");
    }

    #[test]
    fn test_decode_rows_rejects_non_objects() {
        let rows = vec!["[1,2,3]".to_string()];
        assert!(matches!(decode_rows(&rows), Err(StoreError::Decode(_))));
    }
}
