use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use crate::event_sourcing::core::{CallContext, Event};
use crate::metrics::Metrics;

// ============================================================================
// Dispatcher - Concurrent Fan-out with Fault Isolation
// ============================================================================
//
// Each dispatch spawns one task per subscriber and waits for all of them.
// A subscriber that errors or panics is recorded in the returned report and
// never takes the publisher (or the other subscribers) down with it.
// Distinct dispatch calls are serialized by a dispatcher-wide lock.
//
// ============================================================================

pub type HandlerResult = anyhow::Result<()>;

/// A subscriber callback. The call context is passed explicitly.
pub type Subscriber<T> =
    Arc<dyn Fn(CallContext, T) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub type EventSubscriber = Subscriber<Event>;

/// Wrap an async closure as a [`Subscriber`].
pub fn subscriber<T, F, Fut>(handler: F) -> Subscriber<T>
where
    T: 'static,
    F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx: CallContext, item: T| -> BoxFuture<'static, HandlerResult> {
        Box::pin(handler(ctx, item))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a single subscriber did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberFailure {
    #[error("subscriber {subscriber} failed: {reason}")]
    Failed { subscriber: SubscriberId, reason: String },

    #[error("subscriber {subscriber} panicked: {reason}")]
    Panicked { subscriber: SubscriberId, reason: String },

    #[error("subscriber {subscriber} was cancelled")]
    Cancelled { subscriber: SubscriberId },
}

impl SubscriberFailure {
    pub fn subscriber(&self) -> SubscriberId {
        match self {
            Self::Failed { subscriber, .. }
            | Self::Panicked { subscriber, .. }
            | Self::Cancelled { subscriber } => *subscriber,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "error",
            Self::Panicked { .. } => "panic",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{} of {} subscribers failed", .failures.len(), .invoked)]
    SubscribersFailed {
        invoked: usize,
        failures: Vec<SubscriberFailure>,
    },
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failures: Vec<SubscriberFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn panicked(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, SubscriberFailure::Panicked { .. }))
    }

    /// Treat any subscriber failure as an error.
    pub fn into_result(self) -> Result<(), DispatchError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::SubscribersFailed {
                invoked: self.invoked,
                failures: self.failures,
            })
        }
    }
}

/// Run every subscriber on its own task and wait for all of them.
pub(crate) async fn fan_out<T>(
    subscribers: Vec<(SubscriberId, Subscriber<T>)>,
    ctx: &CallContext,
    item: &T,
    metrics: Option<&Metrics>,
) -> DispatchReport
where
    T: Clone + Send + 'static,
{
    let handles: Vec<_> = subscribers
        .into_iter()
        .map(|(id, handler)| {
            let ctx = ctx.clone();
            let item = item.clone();
            (id, tokio::spawn(async move { handler(ctx, item).await }))
        })
        .collect();

    let mut report = DispatchReport {
        invoked: handles.len(),
        failures: Vec::new(),
    };

    for (id, handle) in handles {
        let failure = match handle.await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => SubscriberFailure::Failed {
                subscriber: id,
                reason: format!("{err:#}"),
            },
            Err(join_err) if join_err.is_panic() => SubscriberFailure::Panicked {
                subscriber: id,
                reason: panic_message(join_err.into_panic()),
            },
            Err(_) => SubscriberFailure::Cancelled { subscriber: id },
        };

        tracing::warn!(subscriber = %id, error = %failure, "Subscriber did not complete");
        if let Some(metrics) = metrics {
            metrics.record_subscriber_failure(failure.kind());
        }
        report.failures.push(failure);
    }

    report
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Hands out subscriber ids that are unique per dispatcher.
#[derive(Debug, Default)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub(crate) fn next(&self) -> SubscriberId {
        SubscriberId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ============================================================================
// Dispatcher<T>
// ============================================================================

/// Delivers every dispatched item to every subscriber.
pub struct Dispatcher<T> {
    subscribers: RwLock<Vec<(SubscriberId, Subscriber<T>)>>,
    ids: IdSequence,
    dispatch_lock: Mutex<()>,
    metrics: Option<Arc<Metrics>>,
}

pub type EventDispatcher = Dispatcher<Event>;

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            ids: IdSequence::default(),
            dispatch_lock: Mutex::new(()),
            metrics: None,
        }
    }
}

impl<T> Dispatcher<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_subscriber(&self, handler: Subscriber<T>) -> SubscriberId {
        let id = self.ids.next();
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `item` to all current subscribers; returns once all finished.
    pub async fn dispatch(&self, ctx: &CallContext, item: T) -> DispatchReport {
        let _guard = self.dispatch_lock.lock().await;
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        fan_out(subscribers, ctx, &item, self.metrics.as_deref()).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_event() -> Event {
        Event::new("TEST_EVENT", "some id", "Test", &json!({})).unwrap()
    }

    fn explode() -> HandlerResult {
        panic!("boom")
    }

    fn counting(count: Arc<AtomicUsize>) -> EventSubscriber {
        subscriber(move |_ctx, _event| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_the_event() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.add_subscriber(counting(count.clone()));
        dispatcher.add_subscriber(subscriber({
            let count = count.clone();
            move |_ctx, event: Event| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    anyhow::ensure!(event.event_type == "TEST_EVENT", "wrong type");
                    Ok(())
                }
            }
        }));

        let report = dispatcher.dispatch(&CallContext::new(), test_event()).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(report.invoked, 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.add_subscriber(counting(count.clone()));
        let bad = dispatcher.add_subscriber(subscriber({
            let count = count.clone();
            move |_ctx, _event| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    explode()
                }
            }
        }));
        dispatcher.add_subscriber(counting(count.clone()));

        let report = dispatcher.dispatch(&CallContext::new(), test_event()).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(report.invoked, 3);
        assert!(report.panicked());
        assert_eq!(
            report.failures,
            vec![SubscriberFailure::Panicked {
                subscriber: bad,
                reason: "boom".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_attributed() {
        let dispatcher = EventDispatcher::new();
        let bad = dispatcher.add_subscriber(subscriber(|_ctx, _event| async {
            Err::<(), _>(anyhow::anyhow!("projection offline"))
        }));

        let report = dispatcher.dispatch(&CallContext::new(), test_event()).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscriber(), bad);
        assert!(!report.panicked());
        assert!(report.failures[0].to_string().contains("projection offline"));

        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "1 of 1 subscribers failed");
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_slow_subscribers() {
        let dispatcher = EventDispatcher::new();
        let done = Arc::new(AtomicUsize::new(0));
        for delay in [30u64, 10, 20] {
            let done = done.clone();
            dispatcher.add_subscriber(subscriber(move |_ctx, _event| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        dispatcher.dispatch(&CallContext::new(), test_event()).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_subscribers_run_concurrently() {
        let dispatcher = EventDispatcher::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        for _ in 0..2 {
            let barrier = barrier.clone();
            dispatcher.add_subscriber(subscriber(move |_ctx, _event| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            }));
        }

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(&CallContext::new(), test_event()),
        )
        .await
        .expect("subscribers should not run one after another");
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_context_is_passed_to_subscribers() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(std::sync::Mutex::new(None));
        dispatcher.add_subscriber(subscriber({
            let seen = seen.clone();
            move |ctx: CallContext, _event| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = ctx.user_id.clone();
                    Ok(())
                }
            }
        }));

        let ctx = CallContext::new().with_user("user-9");
        dispatcher.dispatch(&ctx, test_event()).await;
        assert_eq!(seen.lock().unwrap().as_deref(), Some("user-9"));
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers() {
        let dispatcher = EventDispatcher::new();
        let report = dispatcher.dispatch(&CallContext::new(), test_event()).await;
        assert_eq!(report, DispatchReport::default());
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_in_metrics() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let dispatcher = EventDispatcher::new().with_metrics(metrics.clone());
        dispatcher.add_subscriber(subscriber(|_ctx, _event| async {
            Err::<(), _>(anyhow::anyhow!("nope"))
        }));

        dispatcher.dispatch(&CallContext::new(), test_event()).await;
        assert_eq!(
            metrics.dispatch_failures.with_label_values(&["error"]).get(),
            1
        );
    }
}
