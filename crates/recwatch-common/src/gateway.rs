//! Collection gateway abstraction.
//!
//! The watcher only needs two questions answered by a store: "how many
//! records are there?" and "give me all of them". Everything else about the
//! store (transport, auth, query language) stays behind [`CollectionGateway`].

use async_trait::async_trait;
use thiserror::Error;

/// An opaque structured document as returned by the store.
///
/// Field names map to arbitrary JSON values; the watcher never interprets
/// them beyond passing them on to the event sink.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Failed to decode record: {0}")]
    Decode(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to a single named collection.
///
/// Implementations must be safe for concurrent use: the summary reporter and
/// the snapshot differ call into the same gateway from different tasks.
#[async_trait]
pub trait CollectionGateway: Send + Sync {
    /// Name of the collection this gateway reads.
    fn collection(&self) -> &str;

    /// Counts every record in the collection.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Fetches every record currently in the collection, in store order.
    ///
    /// Store order is not guaranteed to be stable between calls.
    async fn fetch_all(&self) -> Result<Vec<Record>, StoreError>;

    /// Fetches records whose numeric `column` is strictly greater than `mark`,
    /// ascending by `column`.
    async fn fetch_after(&self, column: &str, mark: u64) -> Result<Vec<Record>, StoreError>;

    /// Returns the largest value of the numeric `column`, or `None` when the
    /// collection is empty.
    async fn max_value(&self, column: &str) -> Result<Option<u64>, StoreError>;
}

/// Reads a numeric high-water-mark value out of a record.
///
/// Accepts unsigned integers and decimal strings, since ClickHouse renders
/// 64-bit integers as quoted strings in JSON output by default.
pub fn watermark_of(record: &Record, column: &str) -> Option<u64> {
    match record.get(column)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Validates a database, table or column name before it is spliced into SQL.
pub fn validate_identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
