use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::event_sourcing::core::{AggregateRoot, CallContext, Event, ValidationError};
use crate::event_sourcing::dispatch::{EventDispatcher, EventSubscriber, SubscriberId};
use crate::metrics::Metrics;

// ============================================================================
// Event Repository - Backend-agnostic Persistence Contract
// ============================================================================
//
// Responsibilities shared by every backend:
// 1. Fill empty identity metadata (never overwrite caller-set fields)
// 2. Reject the whole batch if any event is invalid
// 3. Write durably, then clear the aggregate's pending list
// 4. Dispatch each written event once, in submission order
// 5. Return reads ordered ascending by sequence number
//
// ============================================================================

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Write every pending event of `aggregate`, then dispatch them.
    async fn persist(&self, ctx: &CallContext, aggregate: &mut AggregateRoot) -> Result<(), RepositoryError>;

    /// All events of an aggregate root, ascending by sequence number.
    async fn get_by_aggregate(&self, root_id: &str) -> Result<Vec<Event>, RepositoryError>;

    /// Events of an aggregate root with `start <= sequence_no <= end`.
    async fn get_by_aggregate_and_sequence_range(
        &self,
        root_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Event>, RepositoryError>;

    /// Events of one entity inside an aggregate root.
    async fn get_by_entity_and_aggregate(
        &self,
        entity_id: &str,
        entity_type: &str,
        root_id: &str,
    ) -> Result<Vec<Event>, RepositoryError>;

    /// Highest recorded sequence number for the root, 0 when it has no events.
    async fn get_aggregate_sequence_number(&self, root_id: &str) -> Result<i64, RepositoryError>;

    fn add_subscriber(&self, handler: EventSubscriber) -> SubscriberId;

    fn subscriber_count(&self) -> usize;

    /// Idempotent schema / table setup.
    async fn migrate(&self) -> Result<(), RepositoryError>;

    /// Commit a held unit of work and open a new one.
    async fn flush(&self) -> Result<(), RepositoryError>;
}

// ============================================================================
// Errors
// ============================================================================

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{backend} backend error: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("batch write failed after {written} of {total} events were written: {source}")]
    PartialWrite {
        written: usize,
        total: usize,
        #[source]
        source: Box<RepositoryError>,
    },

    #[error("unit of work is closed")]
    UnitOfWorkClosed,

    #[error("invalid table name '{0}'")]
    InvalidTableName(String),
}

impl RepositoryError {
    pub fn backend(backend: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Backend {
            backend,
            source: source.into(),
        }
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Serialization(_) => "serialization",
            Self::Backend { .. } => "backend",
            Self::PartialWrite { .. } => "partial_write",
            Self::UnitOfWorkClosed => "unit_of_work_closed",
            Self::InvalidTableName(_) => "invalid_table_name",
        }
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend("postgres", err)
    }
}

impl From<redis::RedisError> for RepositoryError {
    fn from(err: redis::RedisError) -> Self {
        Self::backend("redis", err)
    }
}

// ============================================================================
// Repository Defaults
// ============================================================================

/// Identity used when neither the event nor the call context provides one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryDefaults {
    pub application_id: String,
    pub account_id: String,
    pub group_id: String,
    pub user_id: String,
}

impl RepositoryDefaults {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            ..Self::default()
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}

fn fill_if_empty(field: &mut String, candidates: &[Option<&str>]) {
    if !field.is_empty() {
        return;
    }
    if let Some(value) = candidates
        .iter()
        .flatten()
        .find(|value| !value.is_empty())
    {
        *field = (*value).to_string();
    }
}

/// Fill the identity metadata the caller left empty.
pub fn fill_identity(event: &mut Event, ctx: &CallContext, defaults: &RepositoryDefaults, aggregate_id: &str) {
    let meta = &mut event.meta;
    fill_if_empty(&mut meta.user, &[ctx.user(), Some(defaults.user_id.as_str())]);
    fill_if_empty(&mut meta.account, &[ctx.account(), Some(defaults.account_id.as_str())]);
    fill_if_empty(
        &mut meta.root_id,
        &[Some(aggregate_id), ctx.account(), Some(defaults.account_id.as_str())],
    );
    fill_if_empty(&mut meta.module, &[Some(defaults.application_id.as_str())]);
    fill_if_empty(&mut meta.group, &[Some(defaults.group_id.as_str())]);
}

/// Copy the pending events, fill identity, and validate the whole batch.
///
/// Every invalid event is logged; the first validation error is returned and
/// nothing should be written.
pub(crate) fn prepare_batch(
    ctx: &CallContext,
    defaults: &RepositoryDefaults,
    aggregate: &AggregateRoot,
) -> Result<Vec<Event>, RepositoryError> {
    let mut events = aggregate.new_changes().to_vec();
    let mut first_error: Option<ValidationError> = None;

    for event in &mut events {
        fill_identity(event, ctx, defaults, &aggregate.id);
        if let Err(err) = event.validate() {
            tracing::error!(
                entity_id = %event.meta.entity_id,
                event_id = %event.id,
                error = %err,
                "Error encountered persisting entity"
            );
            first_error.get_or_insert(err);
        }
    }

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(events),
    }
}

/// Dispatch each written event once, in submission order.
pub(crate) async fn publish(dispatcher: &EventDispatcher, ctx: &CallContext, events: Vec<Event>) {
    for event in events {
        let event_id = event.id.clone();
        let report = dispatcher.dispatch(ctx, event).await;
        if !report.is_clean() {
            tracing::warn!(
                event_id = %event_id,
                failed = report.failures.len(),
                invoked = report.invoked,
                "Some subscribers failed to handle event"
            );
        }
    }
}

pub(crate) fn record_persist(
    metrics: Option<&Metrics>,
    backend: &str,
    event_count: usize,
    started: Instant,
    outcome: Result<(), &RepositoryError>,
) {
    if let Some(metrics) = metrics {
        metrics.record_persist(
            backend,
            event_count,
            started.elapsed().as_secs_f64(),
            outcome.err().map(RepositoryError::reason),
        );
    }
}

/// Table / keyspace names are interpolated into statements, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<(), RepositoryError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 48 {
        Ok(())
    } else {
        Err(RepositoryError::InvalidTableName(name.to_string()))
    }
}

/// Stored payload bytes back to JSON; empty bytes read as `null`.
pub(crate) fn decode_payload(bytes: &[u8]) -> Result<Value, serde_json::Error> {
    if bytes.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_slice(bytes)
    }
}

pub(crate) fn in_range(event: &Event, start: i64, end: i64) -> bool {
    (start..=end).contains(&event.meta.sequence_no)
}

pub(crate) fn sort_by_sequence(events: &mut [Event]) {
    events.sort_by_key(|event| event.meta.sequence_no);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(root: &mut AggregateRoot, event: Event) {
        root.new_change(event);
    }

    fn defaults() -> RepositoryDefaults {
        RepositoryDefaults::new("app-1")
            .with_account("default-account")
            .with_group("group-1")
            .with_user("default-user")
    }

    #[test]
    fn test_fill_identity_from_context_first() {
        let mut event = Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap();
        let ctx = CallContext::new().with_account("ctx-account").with_user("ctx-user");

        fill_identity(&mut event, &ctx, &defaults(), "root-1");

        assert_eq!(event.meta.user, "ctx-user");
        assert_eq!(event.meta.account, "ctx-account");
        assert_eq!(event.meta.root_id, "root-1");
        assert_eq!(event.meta.module, "app-1");
        assert_eq!(event.meta.group, "group-1");
    }

    #[test]
    fn test_fill_identity_falls_back_to_defaults() {
        let mut event = Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap();

        fill_identity(&mut event, &CallContext::new(), &defaults(), "");

        assert_eq!(event.meta.user, "default-user");
        assert_eq!(event.meta.account, "default-account");
        assert_eq!(event.meta.root_id, "default-account");
    }

    #[test]
    fn test_fill_identity_never_overwrites() {
        let mut event = Event::new("CREATE_POST", "post-1", "Post", &json!({}))
            .unwrap()
            .with_root("caller-root")
            .with_user("caller-user");
        event.meta.module = "caller-module".to_string();
        event.meta.group = "caller-group".to_string();
        event.meta.account = "caller-account".to_string();

        let ctx = CallContext::new().with_account("ctx-account").with_user("ctx-user");
        fill_identity(&mut event, &ctx, &defaults(), "root-1");

        assert_eq!(event.meta.root_id, "caller-root");
        assert_eq!(event.meta.user, "caller-user");
        assert_eq!(event.meta.module, "caller-module");
        assert_eq!(event.meta.group, "caller-group");
        assert_eq!(event.meta.account, "caller-account");
    }

    #[test]
    fn test_prepare_batch_rejects_whole_batch_on_one_invalid_event() {
        let mut root = AggregateRoot::new("root-1");
        pending(&mut root, Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap());
        pending(&mut root, Event::new("", "post-1", "Post", &json!({})).unwrap());
        pending(&mut root, Event::new("CREATE_POST", "", "Post", &json!({})).unwrap());

        let err = prepare_batch(&CallContext::new(), &defaults(), &root).unwrap_err();

        assert!(matches!(
            err,
            RepositoryError::Validation(ValidationError::MissingType { .. })
        ));
        assert_eq!(root.new_changes().len(), 3);
        assert!(root.new_changes()[0].meta.module.is_empty());
    }

    #[test]
    fn test_prepare_batch_fills_copies() {
        let mut root = AggregateRoot::new("root-1");
        pending(&mut root, Event::new("CREATE_POST", "post-1", "Post", &json!({})).unwrap());

        let events = prepare_batch(&CallContext::new(), &defaults(), &root).unwrap();

        assert_eq!(events[0].meta.root_id, "root-1");
        assert!(root.new_changes()[0].meta.root_id.is_empty());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("events").is_ok());
        assert!(validate_identifier("_events_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2events").is_err());
        assert!(validate_identifier("events; DROP TABLE x").is_err());
    }

    #[test]
    fn test_decode_empty_payload_is_null() {
        assert_eq!(decode_payload(b"").unwrap(), Value::Null);
        assert_eq!(decode_payload(b"{\"a\":1}").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_error_reason_labels() {
        let err = RepositoryError::backend("redis", std::io::Error::other("down"));
        assert_eq!(err.reason(), "backend");
        assert_eq!(err.to_string(), "redis backend error: down");
    }
}
