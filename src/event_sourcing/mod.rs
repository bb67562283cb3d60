// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Generic, reusable event sourcing infrastructure.
// Domain-specific code is in src/domain/
//
// ============================================================================

pub mod core;
pub mod dispatch;
pub mod store;

pub use self::core::*;
pub use dispatch::*;
pub use store::*;
