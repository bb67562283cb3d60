use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::error::ReplayError;
use super::event::{Event, EventMeta};

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// Key Principles:
// 1. State is derived from events (not stored directly)
// 2. New facts are recorded with `new_change` and stay pending until a
//    repository confirms they are durable
// 3. Sequence numbers are assigned here, client-side, before persistence
// 4. Replay folds history in ascending sequence order
//
// ============================================================================

/// Base state for event-sourced aggregates.
///
/// Domain aggregates embed it (usually with `#[serde(flatten)]`) and expose it
/// through [`Reducible::aggregate_root_mut`].
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AggregateRoot {
    pub id: String,
    pub sequence_no: i64,
    pub user: String,
    pub account: String,

    #[serde(skip)]
    new_events: Vec<Event>,
}

impl AggregateRoot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Record a new fact: bump the sequence, stamp it on the event, queue it.
    pub fn new_change(&mut self, mut event: Event) {
        self.sequence_no += 1;
        event.meta.sequence_no = self.sequence_no;
        self.new_events.push(event);
    }

    /// Events recorded since the last successful persist.
    pub fn new_changes(&self) -> &[Event] {
        &self.new_events
    }

    pub fn has_new_changes(&self) -> bool {
        !self.new_events.is_empty()
    }

    /// Drop the pending list. Repositories call this only after a durable write.
    pub fn mark_persisted(&mut self) {
        self.new_events.clear();
    }

    fn apply_meta(&mut self, meta: &EventMeta) {
        if !meta.user.is_empty() {
            self.user = meta.user.clone();
        }
        if !meta.account.is_empty() {
            self.account = meta.account.clone();
        }
        if meta.sequence_no > self.sequence_no {
            self.sequence_no = meta.sequence_no;
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// State that can be rebuilt from events.
///
/// The payload of each event is merged field by field into the serialized
/// state. States that embed an [`AggregateRoot`] return it from
/// `aggregate_root_mut` so replay can also carry identity metadata across.
pub trait Reducible: Serialize + DeserializeOwned {
    fn aggregate_root_mut(&mut self) -> Option<&mut AggregateRoot> {
        None
    }
}

impl Reducible for AggregateRoot {
    fn aggregate_root_mut(&mut self) -> Option<&mut AggregateRoot> {
        Some(self)
    }
}

/// Apply one event to `state`, last write wins per payload field.
pub fn reduce<S: Reducible>(mut state: S, event: &Event) -> Result<S, ReplayError> {
    let pending = state
        .aggregate_root_mut()
        .map(|root| std::mem::take(&mut root.new_events));

    let mut state = match &event.payload {
        Value::Null => state,
        Value::Object(fields) => {
            let mut current = serde_json::to_value(&state).map_err(ReplayError::State)?;
            let target = current.as_object_mut().ok_or(ReplayError::StateNotObject)?;
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
            S::deserialize(current).map_err(|source| ReplayError::Apply {
                event_id: event.id.clone(),
                source,
            })?
        }
        other => {
            return Err(ReplayError::PayloadNotObject {
                event_id: event.id.clone(),
                kind: json_kind(other),
            })
        }
    };

    if let Some(root) = state.aggregate_root_mut() {
        root.apply_meta(&event.meta);
        if let Some(pending) = pending {
            root.new_events = pending;
        }
    }

    Ok(state)
}

/// Fold `events` into `initial`. Events must be in ascending sequence order.
pub fn replay<S: Reducible>(initial: S, events: &[Event]) -> Result<S, ReplayError> {
    let mut previous: Option<i64> = None;
    let mut state = initial;

    for event in events {
        let current = event.meta.sequence_no;
        if let Some(previous) = previous {
            if current <= previous {
                return Err(ReplayError::OutOfOrder { previous, current });
            }
        }
        previous = Some(current);
        state = reduce(state, event)?;
    }

    tracing::debug!(event_count = events.len(), "Replayed events into state");
    Ok(state)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Tests
// ============================================================================
