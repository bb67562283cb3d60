// ============================================================================
// Post Domain - a small blog post aggregate
// ============================================================================
//
// - Events (CREATE_POST, UPDATE_POST, PUBLISH_POST)
// - Errors (PostError enum)
// - Aggregate (Post, rebuilt with the generic reducer)
// - Command Handler (PostCommandHandler, wired into a CommandDispatcher)
//
// ============================================================================

pub mod aggregate;
pub mod command_handler;
pub mod errors;
pub mod events;

pub use aggregate::*;
pub use command_handler::*;
pub use errors::*;
pub use events::*;
