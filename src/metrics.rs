use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkLabels {
    pub queue: String,
    pub transition: Transition,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transition {
    Scheduled,
    Started,
    Completed,
    Canceled,
    Rescheduled,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CasLabels {
    pub outcome: CasOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CasOutcome {
    Swapped,
    Mismatch,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    pub kind: MessageKind,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MessageKind {
    Invalidation,
    LockReleased,
    Shutdown,
    Topic,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StoreLabels {
    pub store: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the coordination layer.
pub struct Metrics {
    // -- work --
    pub work_transitions: Family<WorkLabels, Counter>,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_contentions: Counter,
    pub lock_release_failures: Counter,

    // -- kv --
    pub kv_cas: Family<CasLabels, Counter>,

    // -- invalidation --
    pub invalidations_sent: Counter,
    pub invalidations_received: Counter,

    // -- pubsub --
    pub pubsub_messages: Family<MessageLabels, Counter>,
    pub pubsub_dropped: Family<MessageLabels, Counter>,

    // -- store --
    pub store_errors: Counter,

    // -- transient --
    pub transient_evictions: Counter,
    pub transient_storage_bytes: Family<StoreLabels, Gauge>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let work_transitions = Family::<WorkLabels, Counter>::default();
        registry.register(
            "clustercoord_work_transitions",
            "Work item state transitions by queue",
            work_transitions.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "clustercoord_lock_acquisitions",
            "Distributed locks acquired by this node",
            lock_acquisitions.clone(),
        );

        let lock_contentions = Counter::default();
        registry.register(
            "clustercoord_lock_contentions",
            "Lock requests that found the lock already held",
            lock_contentions.clone(),
        );

        let lock_release_failures = Counter::default();
        registry.register(
            "clustercoord_lock_release_failures",
            "Lock releases rejected because another owner holds the lock",
            lock_release_failures.clone(),
        );

        let kv_cas = Family::<CasLabels, Counter>::default();
        registry.register(
            "clustercoord_kv_cas",
            "Compare-and-set calls by outcome",
            kv_cas.clone(),
        );

        let invalidations_sent = Counter::default();
        registry.register(
            "clustercoord_invalidations_sent",
            "Invalidation batches broadcast by this node",
            invalidations_sent.clone(),
        );

        let invalidations_received = Counter::default();
        registry.register(
            "clustercoord_invalidations_received",
            "Invalidation batches received from other nodes",
            invalidations_received.clone(),
        );

        let pubsub_messages = Family::<MessageLabels, Counter>::default();
        registry.register(
            "clustercoord_pubsub_messages",
            "Pub/sub messages dispatched by kind",
            pubsub_messages.clone(),
        );

        let pubsub_dropped = Family::<MessageLabels, Counter>::default();
        registry.register(
            "clustercoord_pubsub_dropped",
            "Pub/sub messages dropped because their worker queue was full",
            pubsub_dropped.clone(),
        );

        let store_errors = Counter::default();
        registry.register(
            "clustercoord_store_errors",
            "Store errors observed by background loops",
            store_errors.clone(),
        );

        let transient_evictions = Counter::default();
        registry.register(
            "clustercoord_transient_evictions",
            "Transient entries deleted on release because the store was over budget",
            transient_evictions.clone(),
        );

        let transient_storage_bytes = Family::<StoreLabels, Gauge>::default();
        registry.register(
            "clustercoord_transient_storage_bytes",
            "Last observed storage size of each transient store",
            transient_storage_bytes.clone(),
        );

        Self {
            work_transitions,
            lock_acquisitions,
            lock_contentions,
            lock_release_failures,
            kv_cas,
            invalidations_sent,
            invalidations_received,
            pubsub_messages,
            pubsub_dropped,
            store_errors,
            transient_evictions,
            transient_storage_bytes,
        }
    }

    pub(crate) fn work_transition(&self, queue: &str, transition: Transition) {
        self.work_transitions
            .get_or_create(&WorkLabels {
                queue: queue.to_string(),
                transition,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Prometheus text exposition of the registry.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let registry = MetricsRegistry::new();
        registry
            .metrics
            .work_transition("q1", Transition::Scheduled);
        registry.metrics.lock_acquisitions.inc();
        let text = registry.encode().unwrap();
        assert!(text.contains("clustercoord_work_transitions_total"));
        assert!(text.contains("queue=\"q1\""));
        assert!(text.contains("clustercoord_lock_acquisitions_total 1"));
    }
}
