use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::document::{DocumentStore, EventItem};
use super::key_value::KeyValueStore;
use super::repository::RepositoryError;

// ============================================================================
// In-Memory Stores
// ============================================================================
//
// Process-local implementations of the document and key-value store traits.
// Used by the `memory` backend and by tests; the document store can be told to
// fail a given batch request to exercise partial writes.
//
// ============================================================================

const BACKEND: &str = "memory";

#[derive(Debug, thiserror::Error)]
#[error("injected failure on batch request {0}")]
pub struct InjectedFailure(pub usize);

#[derive(Default)]
struct DocumentState {
    // table -> partition key -> sequence number -> item
    tables: BTreeMap<String, HashMap<String, BTreeMap<i64, EventItem>>>,
    batch_sizes: Vec<usize>,
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<DocumentState>,
    fail_on_batch: Option<usize>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th batch request (1-based) without writing it.
    pub fn failing_on_batch(mut self, n: usize) -> Self {
        self.fail_on_batch = Some(n);
        self
    }

    /// Item count of every batch request received so far, including a failed one.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn list_tables(&self) -> Result<Vec<String>, RepositoryError> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    async fn create_table(&self, table: &str) -> Result<(), RepositoryError> {
        self.lock().tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn batch_write(&self, table: &str, items: &[EventItem]) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        state.batch_sizes.push(items.len());

        let request = state.batch_sizes.len();
        if self.fail_on_batch == Some(request) {
            return Err(RepositoryError::backend(BACKEND, InjectedFailure(request)));
        }

        let partitions = state.tables.entry(table.to_string()).or_default();
        for item in items {
            partitions
                .entry(item.partition_key.clone())
                .or_default()
                .insert(item.sequence_no, item.clone());
        }
        Ok(())
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<EventItem>, RepositoryError> {
        let state = self.lock();
        let items = state
            .tables
            .get(table)
            .and_then(|partitions| partitions.get(partition_key))
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default();
        Ok(items)
    }

    async fn query_root(&self, table: &str, root_id: &str) -> Result<Vec<EventItem>, RepositoryError> {
        let state = self.lock();
        let items = state
            .tables
            .get(table)
            .map(|partitions| {
                partitions
                    .values()
                    .flat_map(|items| items.values())
                    .filter(|item| item.root_id == root_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }
}

#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), RepositoryError> {
        self.lock().extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(root_id: &str, partition_key: &str, sequence_no: i64) -> EventItem {
        EventItem {
            partition_key: partition_key.to_string(),
            sequence_no,
            id: format!("event-{sequence_no}"),
            event_type: "CREATE_POST".to_string(),
            payload: b"{}".to_vec(),
            version: 1,
            entity_id: "post-1".to_string(),
            entity_type: "Post".to_string(),
            root_id: root_id.to_string(),
            application_id: String::new(),
            user_id: String::new(),
            account_id: String::new(),
            group_id: String::new(),
            created: String::new(),
        }
    }

    #[tokio::test]
    async fn test_partition_is_sorted_and_upserted() {
        let store = InMemoryDocumentStore::new();
        store
            .batch_write("events", &[item("r", "p", 2), item("r", "p", 1)])
            .await
            .unwrap();
        store.batch_write("events", &[item("r", "p", 2)]).await.unwrap();

        let items = store.query_partition("events", "p").await.unwrap();
        let sequence: Vec<i64> = items.iter().map(|i| i.sequence_no).collect();
        assert_eq!(sequence, vec![1, 2]);
        assert_eq!(store.batch_sizes(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = InMemoryDocumentStore::new().failing_on_batch(1);
        assert!(store.batch_write("events", &[item("r", "p", 1)]).await.is_err());
        assert!(store.query_root("events", "r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_value_roundtrip() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store
            .set_many(vec![("k".to_string(), b"v".to_vec())])
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
