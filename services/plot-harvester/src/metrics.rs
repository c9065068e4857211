// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the plot harvester
//!
//! Exports metrics for monitoring harvesting including:
//! - Total bytes harvested
//! - Transfers by outcome (committed, transfer_failed, validation_failed)
//! - Source polls and removal requests by result
//! - Capacity exhaustion, evictions and cleanup failures
//! - Transfer duration

use std::time::Duration;

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

// Metric definitions are constants; a failure here is a programming error
// (e.g., invalid metric name) and should panic at startup.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all harvester metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Total bytes of committed plots
        pub static ref BYTES_TOTAL: Counter = Counter::with_opts(
            Opts::new("plot_harvester_bytes_total", "Total bytes harvested")
        ).expect("valid metric name");

        /// Transfers by outcome
        pub static ref TRANSFERS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("plot_harvester_transfers_total", "Transfers by outcome"),
            &["outcome"]
        ).expect("valid metric name and labels");

        /// Source polls by result (ok, error)
        pub static ref POLLS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("plot_harvester_polls_total", "Source polls by result"),
            &["result"]
        ).expect("valid metric name and labels");

        /// Transfers not started because no volume had room
        pub static ref CAPACITY_EXHAUSTED: Counter = Counter::with_opts(
            Opts::new(
                "plot_harvester_capacity_exhausted_total",
                "Transfers skipped because no volume had room"
            )
        ).expect("valid metric name");

        /// Plots deleted to make room
        pub static ref EVICTIONS_TOTAL: Counter = Counter::with_opts(
            Opts::new("plot_harvester_evictions_total", "Plots evicted to make room")
        ).expect("valid metric name");

        /// Removal requests sent to sources by result (ok, error)
        pub static ref SOURCE_REMOVALS_TOTAL: CounterVec = CounterVec::new(
            Opts::new(
                "plot_harvester_source_removals_total",
                "Removal requests sent to sources by result"
            ),
            &["result"]
        ).expect("valid metric name and labels");

        /// Partial or rejected files that could not be deleted
        pub static ref CLEANUP_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "plot_harvester_cleanup_failures_total",
                "Total cleanup failures (e.g., failed to remove partial files)"
            )
        ).expect("valid metric name");

        /// Time from transfer start to final outcome
        pub static ref TRANSFER_DURATION: Histogram = Histogram::with_opts(
            HistogramOpts::new(
                "plot_harvester_transfer_duration_seconds",
                "Transfer duration in seconds"
            )
            // Buckets: 10s, 30s, 1m, 2m, 5m, 10m, 20m, 30m, 1h, 2h
            .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0])
        ).expect("valid histogram opts");
    }
}

pub use metrics_impl::{
    BYTES_TOTAL, CAPACITY_EXHAUSTED, CLEANUP_FAILURES, EVICTIONS_TOTAL, POLLS_TOTAL, REGISTRY,
    SOURCE_REMOVALS_TOTAL, TRANSFER_DURATION, TRANSFERS_TOTAL,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(BYTES_TOTAL.clone()))
        .expect("Failed to register BYTES_TOTAL");
    REGISTRY
        .register(Box::new(TRANSFERS_TOTAL.clone()))
        .expect("Failed to register TRANSFERS_TOTAL");
    REGISTRY
        .register(Box::new(POLLS_TOTAL.clone()))
        .expect("Failed to register POLLS_TOTAL");
    REGISTRY
        .register(Box::new(CAPACITY_EXHAUSTED.clone()))
        .expect("Failed to register CAPACITY_EXHAUSTED");
    REGISTRY
        .register(Box::new(EVICTIONS_TOTAL.clone()))
        .expect("Failed to register EVICTIONS_TOTAL");
    REGISTRY
        .register(Box::new(SOURCE_REMOVALS_TOTAL.clone()))
        .expect("Failed to register SOURCE_REMOVALS_TOTAL");
    REGISTRY
        .register(Box::new(CLEANUP_FAILURES.clone()))
        .expect("Failed to register CLEANUP_FAILURES");
    REGISTRY
        .register(Box::new(TRANSFER_DURATION.clone()))
        .expect("Failed to register TRANSFER_DURATION");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

fn result_label(ok: bool) -> &'static str {
    if ok { "ok" } else { "error" }
}

/// Record a committed (and, if configured, validated) plot
pub fn record_transfer_committed(bytes: u64) {
    BYTES_TOTAL.inc_by(bytes as f64);
    TRANSFERS_TOTAL.with_label_values(&["committed"]).inc();
}

/// Record a transfer that failed before commit
pub fn record_transfer_failed() {
    TRANSFERS_TOTAL.with_label_values(&["transfer_failed"]).inc();
}

/// Record a committed plot the validator rejected
pub fn record_validation_failed() {
    TRANSFERS_TOTAL.with_label_values(&["validation_failed"]).inc();
}

pub fn record_poll(ok: bool) {
    POLLS_TOTAL.with_label_values(&[result_label(ok)]).inc();
}

pub fn record_source_removal(ok: bool) {
    SOURCE_REMOVALS_TOTAL
        .with_label_values(&[result_label(ok)])
        .inc();
}

pub fn record_capacity_exhausted() {
    CAPACITY_EXHAUSTED.inc();
}

pub fn record_eviction() {
    EVICTIONS_TOTAL.inc();
}

pub fn record_cleanup_failure() {
    CLEANUP_FAILURES.inc();
}

pub fn observe_transfer_duration(duration: Duration) {
    TRANSFER_DURATION.observe(duration.as_secs_f64());
}
