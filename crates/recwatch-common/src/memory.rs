//! In-memory collection gateway.
//!
//! Holds records in a `Vec` and can be scripted to fail or to report drifting
//! counts, which makes it the gateway of choice for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::gateway::{watermark_of, CollectionGateway, Record, StoreError};

#[derive(Default)]
struct MemoryState {
    records: Vec<Record>,
    failing_counts: usize,
    failing_fetches: usize,
    scripted_counts: VecDeque<u64>,
    count_calls: u64,
    fetch_calls: u64,
}

/// A collection gateway backed by process memory.
pub struct MemoryGateway {
    collection: String,
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    /// Creates an empty in-memory collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self::with_records(collection, Vec::new())
    }

    /// Creates an in-memory collection seeded with `records`.
    pub fn with_records(collection: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            collection: collection.into(),
            state: Mutex::new(MemoryState {
                records,
                ..Default::default()
            }),
        }
    }

    /// Appends a record.
    pub fn push(&self, record: Record) {
        self.state.lock().records.push(record);
    }

    /// Appends several records.
    pub fn extend(&self, records: impl IntoIterator<Item = Record>) {
        self.state.lock().records.extend(records);
    }

    /// Removes the first `n` records, simulating deletions.
    pub fn remove_front(&self, n: usize) {
        let mut state = self.state.lock();
        let n = n.min(state.records.len());
        state.records.drain(..n);
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if the collection holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `n` calls to `count` fail.
    pub fn fail_next_counts(&self, n: usize) {
        self.state.lock().failing_counts = n;
    }

    /// Makes the next `n` calls to `fetch_all`/`fetch_after` fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.state.lock().failing_fetches = n;
    }

    /// Queues count results returned instead of the real length.
    ///
    /// Lets tests model a count that observes a different snapshot than the
    /// following fetch.
    pub fn script_counts(&self, counts: impl IntoIterator<Item = u64>) {
        self.state.lock().scripted_counts.extend(counts);
    }

    /// Number of `count` calls served so far, failed ones included.
    pub fn count_calls(&self) -> u64 {
        self.state.lock().count_calls
    }

    /// Number of fetch calls served so far, failed ones included.
    pub fn fetch_calls(&self) -> u64 {
        self.state.lock().fetch_calls
    }

    fn begin_fetch(&self) -> Result<parking_lot::MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(StoreError::Unavailable("injected fetch failure".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl CollectionGateway for MemoryGateway {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.count_calls += 1;
        if state.failing_counts > 0 {
            state.failing_counts -= 1;
            return Err(StoreError::Unavailable("injected count failure".to_string()));
        }
        if let Some(count) = state.scripted_counts.pop_front() {
            return Ok(count);
        }
        Ok(state.records.len() as u64)
    }

    async fn fetch_all(&self) -> Result<Vec<Record>, StoreError> {
        let state = self.begin_fetch()?;
        Ok(state.records.clone())
    }

    async fn fetch_after(&self, column: &str, mark: u64) -> Result<Vec<Record>, StoreError> {
        let state = self.begin_fetch()?;
        let mut newer: Vec<(u64, Record)> = state
            .records
            .iter()
            .filter_map(|r| watermark_of(r, column).map(|w| (w, r.clone())))
            .filter(|(w, _)| *w > mark)
            .collect();
        newer.sort_by_key(|(w, _)| *w);
        Ok(newer.into_iter().map(|(_, r)| r).collect())
    }

    async fn max_value(&self, column: &str) -> Result<Option<u64>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .records
            .iter()
            .filter_map(|r| watermark_of(r, column))
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(id: u64) -> Record {
        json!({"id": id, "name": format!("user-{id}")})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_count_and_fetch() {
        let gateway = MemoryGateway::with_records("users", vec![rec(1), rec(2)]);
        assert_eq!(gateway.collection(), "users");
        assert_eq!(gateway.count().await.unwrap(), 2);

        gateway.push(rec(3));
        let all = gateway.fetch_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2]["id"], 3);
        assert_eq!(gateway.count_calls(), 1);
        assert_eq!(gateway.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let gateway = MemoryGateway::with_records("users", vec![rec(1)]);
        gateway.fail_next_counts(1);
        gateway.fail_next_fetches(2);

        assert!(gateway.count().await.is_err());
        assert_eq!(gateway.count().await.unwrap(), 1);

        assert!(gateway.fetch_all().await.is_err());
        assert!(gateway.fetch_after("id", 0).await.is_err());
        assert_eq!(gateway.fetch_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_counts() {
        let gateway = MemoryGateway::with_records("users", vec![rec(1)]);
        gateway.script_counts([7, 9]);

        assert_eq!(gateway.count().await.unwrap(), 7);
        assert_eq!(gateway.count().await.unwrap(), 9);
        assert_eq!(gateway.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_front() {
        let gateway = MemoryGateway::with_records("users", vec![rec(1), rec(2), rec(3)]);
        gateway.remove_front(2);
        assert_eq!(gateway.len(), 1);
        gateway.remove_front(10);
        assert!(gateway.is_empty());
    }

    #[tokio::test]
    async fn test_watermark_queries() {
        let gateway = MemoryGateway::with_records("users", vec![rec(5), rec(2), rec(9)]);
        assert_eq!(gateway.max_value("id").await.unwrap(), Some(9));

        let newer = gateway.fetch_after("id", 2).await.unwrap();
        let ids: Vec<_> = newer.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![5, 9]);

        let empty = MemoryGateway::new("empty");
        assert_eq!(empty.max_value("id").await.unwrap(), None);
    }
}
