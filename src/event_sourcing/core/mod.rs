// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Backend-agnostic building blocks:
// - Event / EventMeta (immutable facts)
// - AggregateRoot (pending changes + sequence counter)
// - reduce / replay (rebuild state from history)
// - CallContext (caller identity)
//
// Nothing in here knows about storage.
//
// ============================================================================

pub mod aggregate;
pub mod context;
pub mod error;
pub mod event;

pub use aggregate::{reduce, replay, AggregateRoot, Reducible};
pub use context::CallContext;
pub use error::{ReplayError, ValidationError};
pub use event::{created_now, Event, EventMeta};
