use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::repository::{
    in_range, prepare_batch, publish, record_persist, sort_by_sequence, EventRepository, RepositoryDefaults,
    RepositoryError,
};
use crate::event_sourcing::core::{AggregateRoot, CallContext, Event};
use crate::event_sourcing::dispatch::{EventDispatcher, EventSubscriber, SubscriberId};
use crate::metrics::Metrics;

// ============================================================================
// Key-Value Event Repository
// ============================================================================
//
// Each persist stores JSON arrays of events as blobs:
//
//   aggregate store:  "{entityID}:{entityType}:{rootID}"  -> events of that entity
//                     "root:{rootID}"                     -> events of the root
//   entity store:     "{entityID}"                        -> events of that entity
//
// In `HistoryMode::Replace` a persist overwrites each key with the events of
// the current call. `HistoryMode::Append` reads the stored array first and
// merges, which keeps full history but is not atomic across writers.
//
// ============================================================================

const BACKEND: &str = "key_value";

/// Minimal surface of a blob key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RepositoryError>;

    /// Write all entries together.
    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<(), RepositoryError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryMode {
    #[default]
    Replace,
    Append,
}

impl FromStr for HistoryMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            other => Err(format!("unknown history mode '{other}' (expected replace or append)")),
        }
    }
}

impl fmt::Display for HistoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace => f.write_str("replace"),
            Self::Append => f.write_str("append"),
        }
    }
}

pub fn aggregate_key(entity_id: &str, entity_type: &str, root_id: &str) -> String {
    format!("{entity_id}:{entity_type}:{root_id}")
}

pub fn root_key(root_id: &str) -> String {
    format!("root:{root_id}")
}

pub struct KeyValueEventRepository {
    aggregates: Arc<dyn KeyValueStore>,
    entities: Arc<dyn KeyValueStore>,
    mode: HistoryMode,
    defaults: RepositoryDefaults,
    dispatcher: EventDispatcher,
    metrics: Option<Arc<Metrics>>,
}

impl KeyValueEventRepository {
    pub fn new(
        aggregates: Arc<dyn KeyValueStore>,
        entities: Arc<dyn KeyValueStore>,
        defaults: RepositoryDefaults,
    ) -> Self {
        Self {
            aggregates,
            entities,
            mode: HistoryMode::default(),
            defaults,
            dispatcher: EventDispatcher::new(),
            metrics: None,
        }
    }

    pub fn with_history_mode(mut self, mode: HistoryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.dispatcher = self.dispatcher.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn history_mode(&self) -> HistoryMode {
        self.mode
    }

    /// Events stored under an entity id in the entity store.
    pub async fn get_by_entity(&self, entity_id: &str) -> Result<Vec<Event>, RepositoryError> {
        load(self.entities.as_ref(), entity_id).await
    }

    async fn encode_groups(
        &self,
        store: &dyn KeyValueStore,
        groups: BTreeMap<String, Vec<Event>>,
    ) -> Result<Vec<(String, Vec<u8>)>, RepositoryError> {
        let mut entries = Vec::with_capacity(groups.len());
        for (key, events) in groups {
            let events = match self.mode {
                HistoryMode::Replace => events,
                HistoryMode::Append => merge(load(store, &key).await?, events),
            };
            entries.push((key, serde_json::to_vec(&events)?));
        }
        Ok(entries)
    }

    async fn write(&self, events: &[Event]) -> Result<(), RepositoryError> {
        let mut by_aggregate: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        let mut by_entity: BTreeMap<String, Vec<Event>> = BTreeMap::new();

        for event in events {
            let meta = &event.meta;
            by_aggregate
                .entry(aggregate_key(&meta.entity_id, &meta.entity_type, &meta.root_id))
                .or_default()
                .push(event.clone());
            by_aggregate
                .entry(root_key(&meta.root_id))
                .or_default()
                .push(event.clone());
            by_entity
                .entry(meta.entity_id.clone())
                .or_default()
                .push(event.clone());
        }

        let aggregate_entries = self.encode_groups(self.aggregates.as_ref(), by_aggregate).await?;
        let entity_entries = self.encode_groups(self.entities.as_ref(), by_entity).await?;

        self.aggregates.set_many(aggregate_entries).await?;
        self.entities.set_many(entity_entries).await?;
        Ok(())
    }
}

async fn load(store: &dyn KeyValueStore, key: &str) -> Result<Vec<Event>, RepositoryError> {
    let events: Vec<Event> = match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)?,
        None => Vec::new(),
    };
    tracing::debug!(key, event_count = events.len(), "Loaded events");
    Ok(events)
}

/// Stored history plus new events; a new event replaces a stored one with the same id.
fn merge(stored: Vec<Event>, new: Vec<Event>) -> Vec<Event> {
    let mut merged: Vec<Event> = stored
        .into_iter()
        .filter(|old| !new.iter().any(|event| event.id == old.id))
        .collect();
    merged.extend(new);
    sort_by_sequence(&mut merged);
    merged
}

#[async_trait]
impl EventRepository for KeyValueEventRepository {
    async fn persist(&self, ctx: &CallContext, aggregate: &mut AggregateRoot) -> Result<(), RepositoryError> {
        if !aggregate.has_new_changes() {
            return Ok(());
        }

        let started = Instant::now();
        let event_count = aggregate.new_changes().len();

        let result = match prepare_batch(ctx, &self.defaults, aggregate) {
            Ok(events) => self.write(&events).await.map(|()| events),
            Err(err) => Err(err),
        };
        record_persist(self.metrics.as_deref(), BACKEND, event_count, started, result.as_ref().map(|_| ()));
        let events = result?;

        tracing::info!(aggregate_id = %aggregate.id, event_count, mode = %self.mode, "Events persisted");
        aggregate.mark_persisted();
        publish(&self.dispatcher, ctx, events).await;
        Ok(())
    }

    async fn get_by_aggregate(&self, root_id: &str) -> Result<Vec<Event>, RepositoryError> {
        let mut events = load(self.aggregates.as_ref(), &root_key(root_id)).await?;
        sort_by_sequence(&mut events);
        Ok(events)
    }

    async fn get_by_aggregate_and_sequence_range(
        &self,
        root_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Event>, RepositoryError> {
        let mut events = self.get_by_aggregate(root_id).await?;
        events.retain(|event| in_range(event, start, end));
        Ok(events)
    }

    async fn get_by_entity_and_aggregate(
        &self,
        entity_id: &str,
        entity_type: &str,
        root_id: &str,
    ) -> Result<Vec<Event>, RepositoryError> {
        let key = aggregate_key(entity_id, entity_type, root_id);
        let mut events = load(self.aggregates.as_ref(), &key).await?;
        sort_by_sequence(&mut events);
        Ok(events)
    }

    async fn get_aggregate_sequence_number(&self, root_id: &str) -> Result<i64, RepositoryError> {
        let events = self.get_by_aggregate(root_id).await?;
        Ok(events.iter().map(|event| event.meta.sequence_no).max().unwrap_or(0))
    }

    fn add_subscriber(&self, handler: EventSubscriber) -> SubscriberId {
        self.dispatcher.add_subscriber(handler)
    }

    fn subscriber_count(&self) -> usize {
        self.dispatcher.subscriber_count()
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::store::memory::InMemoryKeyValueStore;
    use serde_json::json;

    struct Fixture {
        aggregates: Arc<InMemoryKeyValueStore>,
        entities: Arc<InMemoryKeyValueStore>,
        repo: KeyValueEventRepository,
    }

    fn fixture(mode: HistoryMode) -> Fixture {
        let aggregates = Arc::new(InMemoryKeyValueStore::new());
        let entities = Arc::new(InMemoryKeyValueStore::new());
        let repo = KeyValueEventRepository::new(aggregates.clone(), entities.clone(), RepositoryDefaults::new("app-1"))
            .with_history_mode(mode);
        Fixture {
            aggregates,
            entities,
            repo,
        }
    }

    fn post_events(root: &mut AggregateRoot, count: usize) {
        for _ in 0..count {
            root.new_change(Event::new("UPDATE_POST", "post-1", "Post", &json!({"title": "t"})).unwrap());
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(aggregate_key("post-1", "Post", "root-1"), "post-1:Post:root-1");
        assert_eq!(root_key("root-1"), "root:root-1");
    }

    #[test]
    fn test_history_mode_parsing() {
        assert_eq!("Replace".parse::<HistoryMode>().unwrap(), HistoryMode::Replace);
        assert_eq!(" append ".parse::<HistoryMode>().unwrap(), HistoryMode::Append);
        assert!("merge".parse::<HistoryMode>().is_err());
    }

    #[tokio::test]
    async fn test_persist_writes_both_stores() {
        let f = fixture(HistoryMode::Replace);
        let mut root = AggregateRoot::new("root-1");
        post_events(&mut root, 3);

        f.repo.persist(&CallContext::new(), &mut root).await.unwrap();

        assert!(f.aggregates.contains("post-1:Post:root-1"));
        assert!(f.aggregates.contains("root:root-1"));
        assert!(f.entities.contains("post-1"));
        assert_eq!(f.repo.get_by_entity("post-1").await.unwrap().len(), 3);
        assert_eq!(
            f.repo
                .get_by_entity_and_aggregate("post-1", "Post", "root-1")
                .await
                .unwrap()
                .len(),
            3
        );
        assert!(!root.has_new_changes());
    }

    #[tokio::test]
    async fn test_replace_mode_keeps_only_latest_call() {
        let f = fixture(HistoryMode::Replace);
        let mut root = AggregateRoot::new("root-1");

        post_events(&mut root, 2);
        f.repo.persist(&CallContext::new(), &mut root).await.unwrap();
        post_events(&mut root, 1);
        f.repo.persist(&CallContext::new(), &mut root).await.unwrap();

        let events = f.repo.get_by_aggregate("root-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta.sequence_no, 3);
    }

    #[tokio::test]
    async fn test_append_mode_keeps_history() {
        let f = fixture(HistoryMode::Append);
        let mut root = AggregateRoot::new("root-1");

        post_events(&mut root, 2);
        f.repo.persist(&CallContext::new(), &mut root).await.unwrap();
        post_events(&mut root, 1);
        f.repo.persist(&CallContext::new(), &mut root).await.unwrap();

        let events = f.repo.get_by_aggregate("root-1").await.unwrap();
        let sequence: Vec<i64> = events.iter().map(|e| e.meta.sequence_no).collect();
        assert_eq!(sequence, vec![1, 2, 3]);
        assert_eq!(f.repo.get_aggregate_sequence_number("root-1").await.unwrap(), 3);
        assert_eq!(
            f.repo
                .get_by_aggregate_and_sequence_range("root-1", 2, 3)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_merge_deduplicates_by_id() {
        let mut first = Event::new("A", "e", "T", &json!({"v": 1})).unwrap();
        first.meta.sequence_no = 1;
        let mut rewritten = first.clone();
        rewritten.payload = json!({"v": 2});
        let mut second = Event::new("A", "e", "T", &json!({})).unwrap();
        second.meta.sequence_no = 2;

        let merged = merge(vec![second.clone(), first], vec![rewritten.clone()]);

        assert_eq!(merged, vec![rewritten, second]);
    }

    #[tokio::test]
    async fn test_missing_keys_read_empty() {
        let f = fixture(HistoryMode::Replace);
        assert!(f.repo.get_by_aggregate("nothing").await.unwrap().is_empty());
        assert!(f.repo.get_by_entity("nothing").await.unwrap().is_empty());
        assert_eq!(f.repo.get_aggregate_sequence_number("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrate_and_flush_are_noops() {
        let f = fixture(HistoryMode::Replace);
        f.repo.migrate().await.unwrap();
        f.repo.flush().await.unwrap();
        assert!(f.aggregates.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_keep_existing_subscribers() {
        let f = fixture(HistoryMode::Replace);
        f.repo.add_subscriber(crate::event_sourcing::dispatch::subscriber(|_ctx, _event: Event| async {
            Ok(())
        }));

        let repo = f.repo.with_metrics(Arc::new(Metrics::new().unwrap()));

        assert_eq!(repo.subscriber_count(), 1);
    }
}
