//! Metrics registry for the attachment controller
//!
//! Provides OpenTelemetry metrics for:
//! - Mountpoint Pod creation and sharing
//! - Optimistic-concurrency conflicts on attachment records
//! - Stale attachments pruned by the sweeper
//! - Reconcile failures

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for controller metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("mountpoint-controller"));

// ============================================================================
// Attachment Metrics
// ============================================================================

/// Counter of Mountpoint Pods created
///
/// Labels:
/// - `reason`: new_record, no_eligible_pod
pub static MOUNTPOINT_PODS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mountpoint_pods_created_total")
        .with_description("Total number of Mountpoint Pods created")
        .with_unit("{pods}")
        .build()
});

/// Counter of workloads attached to an already running Mountpoint Pod
pub static WORKLOADS_SHARED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mountpoint_workloads_shared_total")
        .with_description("Total number of workloads attached to an existing Mountpoint Pod")
        .with_unit("{workloads}")
        .build()
});

/// Counter of resourceVersion conflicts on attachment records
///
/// Labels:
/// - `operation`: create, replace, delete
pub static ATTACHMENT_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mountpoint_attachment_conflicts_total")
        .with_description("Total number of conflicting writes to attachment records")
        .with_unit("{conflicts}")
        .build()
});

/// Counter of stale attachments removed by the sweeper
pub static STALE_ATTACHMENTS_PRUNED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mountpoint_stale_attachments_pruned_total")
        .with_description("Total number of stale workload attachments removed")
        .with_unit("{attachments}")
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Counter of reconcile errors
///
/// Labels:
/// - `error_type`: see `Error::kind`
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mountpoint_reconcile_errors_total")
        .with_description("Total number of pod reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Histogram of sweeper pass duration
pub static SWEEP_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("mountpoint_sweep_duration_seconds")
        .with_description("Duration of stale attachment sweeps in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

/// Record a Mountpoint Pod creation
pub fn record_mountpoint_pod_created(reason: &'static str) {
    MOUNTPOINT_PODS_CREATED.add(1, &[KeyValue::new("reason", reason)]);
}

/// Record a conflicting write on an attachment record
pub fn record_attachment_conflict(operation: &'static str) {
    ATTACHMENT_CONFLICTS.add(1, &[KeyValue::new("operation", operation)]);
}

/// Record a failed reconcile
pub fn record_reconcile_error(error_type: &'static str) {
    RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
}
