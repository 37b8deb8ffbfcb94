// src/metrics.rs

#[cfg(feature = "observability")]
pub use ::metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// Stub macros compile every call site away when observability is disabled.
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Milliseconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

use std::time::Duration;

/// Registers descriptions for every metric the SDK emits. Call once at startup.
pub fn describe_metrics() {
    // Aggregator
    describe_counter!(
        "pricing_source_queries_total",
        Unit::Count,
        "Source queries issued by the aggregator, labeled by source, phase and outcome (ok, error, timeout, skipped)."
    );
    describe_counter!(
        "pricing_results_rejected_total",
        Unit::Count,
        "Source results discarded by validation, labeled by source and reason."
    );
    describe_histogram!(
        "pricing_source_latency_ms",
        Unit::Milliseconds,
        "Latency of a single source query in milliseconds."
    );
    describe_gauge!(
        "pricing_sources_ready",
        "Number of sources currently initialized and available for quoting."
    );
    describe_counter!(
        "pricing_init_attempts_total",
        Unit::Count,
        "Source initialization attempts, labeled by source and outcome."
    );

    // State cache
    describe_counter!(
        "state_logs_applied_total",
        Unit::Count,
        "Logs folded into a tracked contract state."
    );
    describe_counter!(
        "state_logs_dropped_total",
        Unit::Count,
        "Logs ignored by the state cache, labeled by reason (uninitialized, stale, undecodable)."
    );
    describe_counter!(
        "state_reconstructions_total",
        Unit::Count,
        "Full state reconstructions, labeled by outcome."
    );
    describe_counter!(
        "state_reorgs_total",
        Unit::Count,
        "Chain reorganizations handled by the block dispatcher."
    );

    // Catalog
    describe_counter!(
        "catalog_indexer_pages_total",
        Unit::Count,
        "Indexer pages fetched during discovery, labeled by source and block tag."
    );
    describe_gauge!(
        "catalog_pools",
        "Pools known to a source catalog."
    );
    describe_histogram!(
        "catalog_tvl_refresh_ms",
        Unit::Milliseconds,
        "Duration of a TVL eligibility refresh in milliseconds."
    );

    // Shared infrastructure
    describe_counter!(
        "cache_hits_total",
        Unit::Count,
        "Cache store hits, labeled by namespace."
    );
    describe_counter!(
        "cache_miss_total",
        Unit::Count,
        "Cache store misses, labeled by namespace."
    );
    describe_histogram!(
        "multicall_batch_size",
        "Calls per multicall chunk."
    );
    describe_counter!(
        "multicall_failed_calls_total",
        Unit::Count,
        "Sub-calls reported as failed by the multicall contract."
    );
}

// --- Helper functions to update metrics ---

pub fn record_source_query(source: &str, phase: &'static str, outcome: &'static str, elapsed: Duration) {
    counter!(
        "pricing_source_queries_total",
        1,
        "source" => source.to_string(),
        "phase" => phase,
        "outcome" => outcome
    );
    histogram!(
        "pricing_source_latency_ms",
        elapsed.as_secs_f64() * 1000.0,
        "source" => source.to_string(),
        "phase" => phase
    );
}

pub fn increment_rejected_result(source: &str, reason: &'static str) {
    counter!("pricing_results_rejected_total", 1, "source" => source.to_string(), "reason" => reason);
}

pub fn increment_init_attempt(source: &str, outcome: &'static str) {
    counter!("pricing_init_attempts_total", 1, "source" => source.to_string(), "outcome" => outcome);
}

pub fn set_sources_ready(count: usize) {
    gauge!("pricing_sources_ready", count as f64);
}

pub fn increment_logs_applied(source: &str, count: u64) {
    counter!("state_logs_applied_total", count, "source" => source.to_string());
}

pub fn increment_logs_dropped(source: &str, reason: &'static str) {
    counter!("state_logs_dropped_total", 1, "source" => source.to_string(), "reason" => reason);
}

pub fn increment_reconstruction(source: &str, outcome: &'static str) {
    counter!("state_reconstructions_total", 1, "source" => source.to_string(), "outcome" => outcome);
}

pub fn increment_reorgs() {
    increment_counter!("state_reorgs_total");
}

pub fn increment_indexer_page(source: &str, block_tag: &'static str) {
    counter!("catalog_indexer_pages_total", 1, "source" => source.to_string(), "block" => block_tag);
}

pub fn set_catalog_pools(source: &str, count: usize) {
    gauge!("catalog_pools", count as f64, "source" => source.to_string());
}

pub fn record_tvl_refresh(source: &str, elapsed: Duration) {
    histogram!(
        "catalog_tvl_refresh_ms",
        elapsed.as_secs_f64() * 1000.0,
        "source" => source.to_string()
    );
}

pub fn increment_cache_hit(namespace: &str) {
    counter!("cache_hits_total", 1, "cache" => namespace.to_string());
}

pub fn increment_cache_miss(namespace: &str) {
    counter!("cache_miss_total", 1, "cache" => namespace.to_string());
}

pub fn record_multicall_batch_size(size: usize) {
    histogram!("multicall_batch_size", size as f64);
}

pub fn increment_multicall_failed_calls(count: u64) {
    counter!("multicall_failed_calls_total", count);
}
