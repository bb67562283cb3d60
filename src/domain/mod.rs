// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Domain aggregates built on the event sourcing core. Each aggregate has its
// own subdirectory with:
// - Events (type names and payloads)
// - Errors
// - Aggregate implementation
// - Command handler
//
// ============================================================================

pub mod post;
