//! Prometheus metrics emitted by the sync engine
//!
//! The library only records through the `metrics` facade; the controller
//! binary installs the exporter.

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

pub const LIST_REFRESHES: &str = "secrets_sync_list_refreshes_total";
pub const REMOTE_FETCHES: &str = "secrets_sync_remote_fetches_total";
pub const CACHED_DESCRIPTORS: &str = "secrets_sync_cached_descriptors";
pub const RECONCILES: &str = "secrets_sync_reconciles_total";
pub const OUTPUT_WRITES: &str = "secrets_sync_output_writes_total";
pub const TRACKED_RESOURCES: &str = "secrets_sync_tracked_resources";

/// Register descriptions for every metric.
pub fn describe_metrics() {
    describe_counter!(LIST_REFRESHES, Unit::Count, "Remote secret list refreshes by status");
    describe_counter!(REMOTE_FETCHES, Unit::Count, "Remote secret value fetches by status");
    describe_gauge!(CACHED_DESCRIPTORS, Unit::Count, "Secret descriptors currently cached");
    describe_counter!(RECONCILES, Unit::Count, "Mapping resource reconciliations by outcome");
    describe_counter!(OUTPUT_WRITES, Unit::Count, "Secrets written to the output store");
    describe_gauge!(TRACKED_RESOURCES, Unit::Count, "Mapping resources currently tracked");
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

pub fn record_list_refresh(success: bool) {
    counter!(LIST_REFRESHES, "status" => status(success)).increment(1);
}

pub fn record_remote_fetch(success: bool) {
    counter!(REMOTE_FETCHES, "status" => status(success)).increment(1);
}

pub fn set_cached_descriptors(count: usize) {
    gauge!(CACHED_DESCRIPTORS).set(count as f64);
}

/// `outcome` is `written`, `unchanged` or a failure reason.
pub fn record_reconcile(outcome: &'static str) {
    counter!(RECONCILES, "outcome" => outcome).increment(1);
}

pub fn record_output_write() {
    counter!(OUTPUT_WRITES).increment(1);
}

pub fn set_tracked_resources(count: usize) {
    gauge!(TRACKED_RESOURCES).set(count as f64);
}
