// ============================================================================
// Dispatch - fan-out of committed events and incoming commands
// ============================================================================

pub mod command;
pub mod dispatcher;

pub use command::{Command, CommandDispatcher, CommandMetadata, CommandSubscriber, WILDCARD};
pub use dispatcher::{
    subscriber, DispatchError, DispatchReport, Dispatcher, EventDispatcher, EventSubscriber,
    HandlerResult, Subscriber, SubscriberFailure, SubscriberId,
};
