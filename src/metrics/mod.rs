use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

// ============================================================================
// Metrics Module - Prometheus metrics for the event store
// ============================================================================
//
// Provides metrics for:
// - Events persisted per backend
// - Persist failures by backend and reason
// - Persist latency
// - Document store batch writes
// - Subscriber failures during dispatch
//
// Exposition is left to the embedding application via `registry()`.
// ============================================================================

/// Central metrics registry for the event store
pub struct Metrics {
    registry: Registry,

    pub events_persisted: IntCounterVec,
    pub persist_failures: IntCounterVec,
    pub persist_duration: HistogramVec,
    pub batch_writes: IntCounter,
    pub dispatch_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_persisted = IntCounterVec::new(
            Opts::new("events_persisted_total", "Total events durably persisted"),
            &["backend"],
        )?;
        registry.register(Box::new(events_persisted.clone()))?;

        let persist_failures = IntCounterVec::new(
            Opts::new("persist_failures_total", "Total persist calls that failed"),
            &["backend", "reason"],
        )?;
        registry.register(Box::new(persist_failures.clone()))?;

        let persist_duration = HistogramVec::new(
            HistogramOpts::new("persist_duration_seconds", "Persist call duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["backend"],
        )?;
        registry.register(Box::new(persist_duration.clone()))?;

        let batch_writes = IntCounter::new(
            "document_batch_writes_total",
            "Total batch-write requests issued to the document store",
        )?;
        registry.register(Box::new(batch_writes.clone()))?;

        let dispatch_failures = IntCounterVec::new(
            Opts::new("dispatch_failures_total", "Subscribers that errored, panicked or were cancelled"),
            &["kind"],
        )?;
        registry.register(Box::new(dispatch_failures.clone()))?;

        Ok(Self {
            registry,
            events_persisted,
            persist_failures,
            persist_duration,
            batch_writes,
            dispatch_failures,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Helper to record a finished persist call
    pub fn record_persist(&self, backend: &str, event_count: usize, duration_secs: f64, failure: Option<&str>) {
        match failure {
            None => self
                .events_persisted
                .with_label_values(&[backend])
                .inc_by(event_count as u64),
            Some(reason) => self
                .persist_failures
                .with_label_values(&[backend, reason])
                .inc(),
        }
        self.persist_duration
            .with_label_values(&[backend])
            .observe(duration_secs);
    }

    pub fn record_batch_write(&self) {
        self.batch_writes.inc();
    }

    pub fn record_subscriber_failure(&self, kind: &str) {
        self.dispatch_failures.with_label_values(&[kind]).inc();
    }
}
