use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::repository::{
    decode_payload, in_range, prepare_batch, publish, record_persist, sort_by_sequence, EventRepository,
    RepositoryDefaults, RepositoryError,
};
use crate::event_sourcing::core::{AggregateRoot, CallContext, Event, EventMeta};
use crate::event_sourcing::dispatch::{EventDispatcher, EventSubscriber, SubscriberId};
use crate::metrics::Metrics;

// ============================================================================
// Document-Batch Event Repository
// ============================================================================
//
// Events are stored as items in a wide-column / document table:
// - partition key: root id + entity type + entity id
// - sort key:      sequence number
//
// Writes go out in batch requests of at most `batch_limit` items. Batches are
// not atomic with each other; a failure part-way leaves the earlier batches
// written and is reported as `RepositoryError::PartialWrite`.
//
// ============================================================================

/// Largest batch most document stores accept in one request.
pub const DEFAULT_BATCH_LIMIT: usize = 25;

const BACKEND: &str = "document";

/// Partition key for one (root, type, entity) stream. Each part is prefixed
/// with its byte length so distinct triples never share a key.
pub fn partition_key(root_id: &str, entity_type: &str, entity_id: &str) -> String {
    format!(
        "{}:{root_id}{}:{entity_type}{}:{entity_id}",
        root_id.len(),
        entity_type.len(),
        entity_id.len()
    )
}

/// One stored event, flattened to table columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventItem {
    pub partition_key: String,
    pub sequence_no: i64,
    pub id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub version: i32,
    pub entity_id: String,
    pub entity_type: String,
    pub root_id: String,
    pub application_id: String,
    pub user_id: String,
    pub account_id: String,
    pub group_id: String,
    pub created: String,
}

impl EventItem {
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let meta = &event.meta;
        Ok(Self {
            partition_key: partition_key(&meta.root_id, &meta.entity_type, &meta.entity_id),
            sequence_no: meta.sequence_no,
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            payload: serde_json::to_vec(&event.payload)?,
            version: event.version,
            entity_id: meta.entity_id.clone(),
            entity_type: meta.entity_type.clone(),
            root_id: meta.root_id.clone(),
            application_id: meta.module.clone(),
            user_id: meta.user.clone(),
            account_id: meta.account.clone(),
            group_id: meta.group.clone(),
            created: meta.created.clone(),
        })
    }

    pub fn into_event(self) -> Result<Event, serde_json::Error> {
        let payload = decode_payload(&self.payload)?;
        let meta = EventMeta {
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            root_id: self.root_id,
            sequence_no: self.sequence_no,
            user: self.user_id,
            module: self.application_id,
            account: self.account_id,
            group: self.group_id,
            created: self.created,
        };
        Ok(Event::from_parts(self.id, self.event_type, payload, self.version, meta))
    }
}

/// Minimal surface of a document / wide-column store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<String>, RepositoryError>;

    async fn create_table(&self, table: &str) -> Result<(), RepositoryError>;

    /// Write one batch request. Callers never pass more than their batch limit.
    async fn batch_write(&self, table: &str, items: &[EventItem]) -> Result<(), RepositoryError>;

    async fn query_partition(&self, table: &str, partition_key: &str) -> Result<Vec<EventItem>, RepositoryError>;

    async fn query_root(&self, table: &str, root_id: &str) -> Result<Vec<EventItem>, RepositoryError>;
}

pub struct DocumentEventRepository {
    store: Arc<dyn DocumentStore>,
    table: String,
    batch_limit: usize,
    defaults: RepositoryDefaults,
    dispatcher: EventDispatcher,
    metrics: Option<Arc<Metrics>>,
}

impl DocumentEventRepository {
    pub fn new(store: Arc<dyn DocumentStore>, table: &str, defaults: RepositoryDefaults) -> Self {
        Self {
            store,
            table: table.to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            defaults,
            dispatcher: EventDispatcher::new(),
            metrics: None,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.dispatcher = self.dispatcher.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    async fn write_batches(&self, events: &[Event]) -> Result<(), RepositoryError> {
        let items = events
            .iter()
            .map(EventItem::from_event)
            .collect::<Result<Vec<_>, _>>()?;

        let total = items.len();
        let mut written = 0;

        for chunk in items.chunks(self.batch_limit) {
            if let Err(err) = self.store.batch_write(&self.table, chunk).await {
                tracing::error!(
                    table = %self.table,
                    written,
                    total,
                    error = %err,
                    "Batch write failed"
                );
                if written == 0 {
                    return Err(err);
                }
                return Err(RepositoryError::PartialWrite {
                    written,
                    total,
                    source: Box::new(err),
                });
            }

            written += chunk.len();
            if let Some(metrics) = &self.metrics {
                metrics.record_batch_write();
            }
            tracing::debug!(table = %self.table, written, total, "Batch written");
        }

        Ok(())
    }

    async fn load_root(&self, root_id: &str) -> Result<Vec<Event>, RepositoryError> {
        let items = self.store.query_root(&self.table, root_id).await?;
        let mut events = items
            .into_iter()
            .map(EventItem::into_event)
            .collect::<Result<Vec<_>, _>>()?;
        sort_by_sequence(&mut events);
        tracing::debug!(root_id, event_count = events.len(), "Loaded events");
        Ok(events)
    }
}

#[async_trait]
impl EventRepository for DocumentEventRepository {
    async fn persist(&self, ctx: &CallContext, aggregate: &mut AggregateRoot) -> Result<(), RepositoryError> {
        if !aggregate.has_new_changes() {
            return Ok(());
        }

        let started = Instant::now();
        let event_count = aggregate.new_changes().len();

        let result = match prepare_batch(ctx, &self.defaults, aggregate) {
            Ok(events) => self.write_batches(&events).await.map(|()| events),
            Err(err) => Err(err),
        };
        record_persist(self.metrics.as_deref(), BACKEND, event_count, started, result.as_ref().map(|_| ()));
        let events = result?;

        tracing::info!(aggregate_id = %aggregate.id, event_count, table = %self.table, "Events persisted");
        aggregate.mark_persisted();
        publish(&self.dispatcher, ctx, events).await;
        Ok(())
    }

    async fn get_by_aggregate(&self, root_id: &str) -> Result<Vec<Event>, RepositoryError> {
        self.load_root(root_id).await
    }

    async fn get_by_aggregate_and_sequence_range(
        &self,
        root_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Event>, RepositoryError> {
        let mut events = self.load_root(root_id).await?;
        events.retain(|event| in_range(event, start, end));
        Ok(events)
    }

    async fn get_by_entity_and_aggregate(
        &self,
        entity_id: &str,
        entity_type: &str,
        root_id: &str,
    ) -> Result<Vec<Event>, RepositoryError> {
        let key = partition_key(root_id, entity_type, entity_id);
        let items = self.store.query_partition(&self.table, &key).await?;

        // Stores may share a partition across tables or layouts; keep exact matches.
        let mut events = items
            .into_iter()
            .filter(|item| item.entity_id == entity_id && item.entity_type == entity_type && item.root_id == root_id)
            .map(EventItem::into_event)
            .collect::<Result<Vec<_>, _>>()?;
        sort_by_sequence(&mut events);
        Ok(events)
    }

    async fn get_aggregate_sequence_number(&self, root_id: &str) -> Result<i64, RepositoryError> {
        let items = self.store.query_root(&self.table, root_id).await?;
        Ok(items.iter().map(|item| item.sequence_no).max().unwrap_or(0))
    }

    fn add_subscriber(&self, handler: EventSubscriber) -> SubscriberId {
        self.dispatcher.add_subscriber(handler)
    }

    fn subscriber_count(&self) -> usize {
        self.dispatcher.subscriber_count()
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        let tables = self.store.list_tables().await?;
        if tables.iter().any(|name| name == &self.table) {
            tracing::debug!(table = %self.table, "Event table already exists");
            return Ok(());
        }

        self.store.create_table(&self.table).await?;
        tracing::info!(table = %self.table, "Event table created");
        Ok(())
    }

    async fn flush(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
