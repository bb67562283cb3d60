use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::dispatcher::{fan_out, DispatchReport, IdSequence, Subscriber, SubscriberId};
use crate::event_sourcing::core::CallContext;
use crate::metrics::Metrics;

// ============================================================================
// Commands - Incoming Requests
// ============================================================================

/// Subscribers registered under this type receive every command.
pub const WILDCARD: &str = "*";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: CommandMetadata,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandMetadata {
    pub version: i64,
    pub execution_date: Option<DateTime<Utc>>,
    pub application_id: String,
    pub account_id: String,
    pub user_id: String,
}

impl CommandMetadata {
    /// A command without an execution date is due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execution_date.map_or(true, |at| at <= now)
    }
}

impl Command {
    pub fn new<P: Serialize>(command_type: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            command_type: command_type.to_string(),
            payload: serde_json::to_value(payload)?,
            metadata: CommandMetadata {
                version: 1,
                ..CommandMetadata::default()
            },
        })
    }

    pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Caller identity carried in the command metadata.
    pub fn context(&self) -> CallContext {
        let mut ctx = CallContext::new();
        if !self.metadata.account_id.is_empty() {
            ctx = ctx.with_account(self.metadata.account_id.clone());
        }
        if !self.metadata.user_id.is_empty() {
            ctx = ctx.with_user(self.metadata.user_id.clone());
        }
        ctx
    }
}

// ============================================================================
// Command Dispatcher
// ============================================================================

pub type CommandSubscriber = Subscriber<Command>;

/// Routes each command to the wildcard subscribers plus the subscribers
/// registered for its type, all invoked together.
pub struct CommandDispatcher {
    handlers: RwLock<HashMap<String, Vec<(SubscriberId, CommandSubscriber)>>>,
    ids: IdSequence,
    dispatch_lock: Mutex<()>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            ids: IdSequence::default(),
            dispatch_lock: Mutex::new(()),
            metrics: None,
        }
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register `handler` for `command_type`, or for all types with [`WILDCARD`].
    pub fn add_subscriber(&self, command_type: &str, handler: CommandSubscriber) -> SubscriberId {
        let id = self.ids.next();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(command_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Number of subscribers a command of this type would reach.
    pub fn subscriber_count(&self, command_type: &str) -> usize {
        self.subscribers_for(command_type).len()
    }

    fn subscribers_for(&self, command_type: &str) -> Vec<(SubscriberId, CommandSubscriber)> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut all = handlers.get(WILDCARD).cloned().unwrap_or_default();
        if command_type != WILDCARD {
            if let Some(typed) = handlers.get(command_type) {
                all.extend(typed.iter().cloned());
            }
        }
        all
    }

    pub async fn dispatch(&self, ctx: &CallContext, command: Command) -> DispatchReport {
        let _guard = self.dispatch_lock.lock().await;
        let subscribers = self.subscribers_for(&command.command_type);

        tracing::debug!(
            command_type = %command.command_type,
            subscriber_count = subscribers.len(),
            "Dispatching command"
        );

        fan_out(subscribers, ctx, &command, self.metrics.as_deref()).await
    }
}
