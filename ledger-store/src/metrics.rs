//! Prometheus metrics for the ledger
//!
//! Each [`Metrics`] owns its own registry, so several ledgers can live in
//! one process.
//!
//! # Metrics
//!
//! - `ledger_cache_hits_total` / `ledger_cache_misses_total` - account lookups
//! - `ledger_cache_evictions_total` - accounts handed to write-back
//! - `ledger_cache_resident_accounts` - resident count at the last scan
//! - `ledger_mutations_queued_total` - mutations recorded for non-resident accounts
//! - `ledger_mutations_reconciled_total` - queued mutations applied by the scan
//! - `ledger_reconcile_runs_total` - reconciliation scans
//! - `ledger_write_failures_total` - failed upserts and appends (retried later)
//! - `ledger_operation_duration_seconds` - facade operation latency

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Lookups served from the cache
    pub cache_hits: IntCounter,

    /// Lookups that went to the backend
    pub cache_misses: IntCounter,

    /// Evictions handed to the write-back path
    pub evictions: IntCounter,

    /// Resident accounts
    pub resident_accounts: IntGauge,

    /// Mutations queued for reconciliation
    pub mutations_queued: IntCounter,

    /// Queued mutations applied
    pub mutations_reconciled: IntCounter,

    /// Reconciliation scans run
    pub reconcile_runs: IntCounter,

    /// Failed backend writes
    pub write_failures: IntCounter,

    /// Facade operation latency
    pub operation_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create a collector with a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let cache_hits = counter("ledger_cache_hits_total", "Account lookups served from cache")?;
        let cache_misses = counter("ledger_cache_misses_total", "Account lookups that hit the backend")?;
        let evictions = counter("ledger_cache_evictions_total", "Accounts evicted to write-back")?;
        let mutations_queued = counter(
            "ledger_mutations_queued_total",
            "Mutations recorded for non-resident accounts",
        )?;
        let mutations_reconciled = counter(
            "ledger_mutations_reconciled_total",
            "Queued mutations applied by reconciliation",
        )?;
        let reconcile_runs = counter("ledger_reconcile_runs_total", "Reconciliation scans")?;
        let write_failures = counter("ledger_write_failures_total", "Failed backend writes")?;

        let resident_accounts =
            IntGauge::new("ledger_cache_resident_accounts", "Resident accounts")?;
        registry.register(Box::new(resident_accounts.clone()))?;

        let operation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_operation_duration_seconds",
                "Facade operation latency",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]),
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            cache_hits,
            cache_misses,
            evictions,
            resident_accounts,
            mutations_queued,
            mutations_reconciled,
            reconcile_runs,
            write_failures,
            operation_duration,
            registry,
        })
    }

    /// Record operation duration
    pub fn record_duration(&self, duration_seconds: f64) {
        self.operation_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
