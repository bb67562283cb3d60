// ============================================================================
// es_core - Event Sourcing Core
// ============================================================================
//
// Events, aggregates and replay live in `event_sourcing::core`.
// Subscriber fan-out lives in `event_sourcing::dispatch`.
// The repository contract and its storage backends live in
// `event_sourcing::store`.
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod event_sourcing;
pub mod metrics;
