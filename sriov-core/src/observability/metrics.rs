//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//!
//! Metrics only exist when the embedding process installs a `metrics`
//! recorder (an exporter) before calling [`register_core_metrics`]. Neither
//! this crate nor the `sriov-config` binary installs one, so without it every
//! macro below is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Partitioning
    describe_counter!("sriov_vfs_created_total", "VF creation events matched to a PF");
    describe_counter!("sriov_pfs_configured_total", "PFs configured (by link mode)");
    describe_counter!("sriov_pfs_skipped_total", "PFs skipped because their VF count already matched");
    describe_counter!("sriov_switchdev_transitions_total", "eswitch mode changes to switchdev");

    // Persistence
    describe_counter!("sriov_udev_rules_changed_total", "udev rule file writes");

    // External programs
    describe_counter!(
        "sriov_command_failures_total",
        "External commands that failed after every retry (by program)"
    );

    describe_histogram!("sriov_provision_duration_seconds", "Duration of a full provisioning run");
}

pub fn record_pf_configured(link_mode: &str) {
    counter!("sriov_pfs_configured_total", "link_mode" => link_mode.to_string()).increment(1);
}

pub fn record_pf_skipped() {
    counter!("sriov_pfs_skipped_total").increment(1);
}

pub fn record_provision(duration_secs: f64) {
    histogram!("sriov_provision_duration_seconds").record(duration_secs);
}
