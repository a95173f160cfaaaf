//! PubSub metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application (waddle-server).

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-pubsub"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for notification stanzas handed to the router.
pub fn notifications_sent() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.notifications.sent")
        .with_description("Total pubsub event notifications routed")
        .with_unit("stanza")
        .build()
}

/// Counter for items published.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.published")
        .with_description("Total items published to leaf nodes")
        .with_unit("item")
        .build()
}

/// Counter for cluster tasks executed on this member.
pub fn cluster_tasks() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.cluster.tasks")
        .with_description("Total cluster tasks executed locally")
        .with_unit("task")
        .build()
}

/// Counter for persistence flushes.
pub fn gateway_flushes() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.persistence.flushes")
        .with_description("Total persistence gateway flushes")
        .with_unit("flush")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a notification routed to a subscriber.
pub fn record_notification(event: &str, service: &str) {
    notifications_sent().add(
        1,
        &[
            KeyValue::new("event", event.to_string()),
            KeyValue::new("service", service.to_string()),
        ],
    );
}

/// Record an item publication.
pub fn record_item_published(service: &str) {
    items_published().add(1, &[KeyValue::new("service", service.to_string())]);
}

/// Record a cluster task run and whether it changed local state.
pub fn record_cluster_task(kind: &str, applied: bool) {
    cluster_tasks().add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", if applied { "applied" } else { "skipped" }),
        ],
    );
}

/// Record a gateway flush.
pub fn record_flush(scope: &str, success: bool) {
    gateway_flushes().add(
        1,
        &[
            KeyValue::new("scope", scope.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}
