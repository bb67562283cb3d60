// ============================================================================
// Core Errors - Event validation and replay
// ============================================================================

/// Reasons an event is rejected at persist time.
///
/// The first failing check wins; the same error is also recorded on the event
/// itself (see [`Event::errors`](super::Event::errors)).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("all events must have an id (entity '{entity_id}')")]
    MissingId { entity_id: String },

    #[error("event '{event_id}' must be associated with an entity")]
    MissingEntityId { event_id: String },

    #[error("event '{event_id}' must have a positive version, got {version}")]
    InvalidVersion { event_id: String, version: i32 },

    #[error("event '{event_id}' must have a type")]
    MissingType { event_id: String },

    #[error("event '{event_id}' has no sequence number; add it through new_change")]
    MissingSequenceNo { event_id: String },
}

/// Errors raised while folding events into aggregate state.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("event '{event_id}' payload must be a JSON object to be reduced, got {kind}")]
    PayloadNotObject { event_id: String, kind: &'static str },

    #[error("state cannot be represented as a JSON object")]
    StateNotObject,

    #[error("event '{event_id}' could not be applied to state: {source}")]
    Apply {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state serialization failed: {0}")]
    State(#[source] serde_json::Error),

    #[error("events out of order: sequence {current} follows {previous}")]
    OutOfOrder { previous: i64, current: i64 },
}
