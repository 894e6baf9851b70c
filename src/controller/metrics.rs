//! Prometheus metrics for the MariaDB failover operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `mariadb_failover_switchovers_total` (counter): attempts labeled by namespace/name/trigger/result.
//! - `mariadb_failover_phase_duration_seconds` (histogram): switchover phase duration labeled by phase.
//! - `mariadb_failover_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `mariadb_failover_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `mariadb_failover_primary_failing` (gauge): 1 while the primary fails its probes.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

const CONTROLLER: &str = "mariadbcluster";

/// Labels identifying one cluster
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SwitchoverLabels {
    pub namespace: String,
    pub name: String,
    /// "Planned" or "Unplanned"
    pub trigger: String,
    /// "success" or "failure"
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "kube", "unreachable", "sync_timeout"
    pub kind: String,
}

pub static SWITCHOVERS_TOTAL: Lazy<Family<SwitchoverLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PHASE_DURATION_SECONDS: Lazy<Family<PhaseLabels, Histogram>> = Lazy::new(|| {
    fn phase_histogram() -> Histogram {
        // 1ms .. ~65s across 17 buckets
        Histogram::new(exponential_buckets(0.001, 2.0, 17))
    }
    Family::new_with_constructor(phase_histogram)
});

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PRIMARY_FAILING: Lazy<Family<ClusterLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "mariadb_failover_switchovers",
        "Switchover attempts by trigger and result",
        SWITCHOVERS_TOTAL.clone(),
    );
    registry.register(
        "mariadb_failover_phase_duration_seconds",
        "Duration of switchover phases in seconds",
        PHASE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "mariadb_failover_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "mariadb_failover_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "mariadb_failover_primary_failing",
        "Whether the current primary is failing its health probes",
        PRIMARY_FAILING.clone(),
    );

    registry
});

pub fn record_switchover(namespace: &str, name: &str, trigger: &str, result: &str) {
    let labels = SwitchoverLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        trigger: trigger.to_string(),
        result: result.to_string(),
    };
    SWITCHOVERS_TOTAL.get_or_create(&labels).inc();
}

pub fn observe_phase_duration(phase: &str, seconds: f64) {
    let labels = PhaseLabels {
        phase: phase.to_string(),
    };
    PHASE_DURATION_SECONDS.get_or_create(&labels).observe(seconds);
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(seconds: f64) {
    let labels = ReconcileLabels {
        controller: CONTROLLER.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(kind: &str) {
    let labels = ErrorLabels {
        controller: CONTROLLER.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_primary_failing(namespace: &str, name: &str, failing: bool) {
    let labels = ClusterLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    PRIMARY_FAILING
        .get_or_create(&labels)
        .set(i64::from(failing));
}
