//! Metrics collection for observability
//!
//! Prometheus metrics for the chain and settlement queue. Each [`Metrics`]
//! owns its own registry so several chains can live in one process.
//!
//! # Metrics
//!
//! - `chain_blocks_total` - Blocks appended
//! - `chain_events_total` - Events appended
//! - `chain_length` - Blocks in the chain
//! - `chain_append_duration_seconds` - Histogram of append latencies
//! - `settlement_items_extracted_total` - Queue items created
//! - `settlement_items_settled_total` - Queue items completed
//! - `settlement_items_failed_total` - Queue items failed

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Blocks appended
    pub blocks_total: IntCounter,

    /// Events appended
    pub events_total: IntCounter,

    /// Current chain length
    pub chain_length: IntGauge,

    /// Append duration histogram
    pub append_duration: Histogram,

    /// Queue items created
    pub items_extracted: IntCounter,

    /// Queue items completed
    pub items_settled: IntCounter,

    /// Queue items failed
    pub items_failed: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_total = IntCounter::new("chain_blocks_total", "Blocks appended")?;
        registry.register(Box::new(blocks_total.clone()))?;

        let events_total = IntCounter::new("chain_events_total", "Events appended")?;
        registry.register(Box::new(events_total.clone()))?;

        let chain_length = IntGauge::new("chain_length", "Blocks in the chain")?;
        registry.register(Box::new(chain_length.clone()))?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new("chain_append_duration_seconds", "Histogram of append latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let items_extracted =
            IntCounter::new("settlement_items_extracted_total", "Queue items created")?;
        registry.register(Box::new(items_extracted.clone()))?;

        let items_settled =
            IntCounter::new("settlement_items_settled_total", "Queue items completed")?;
        registry.register(Box::new(items_settled.clone()))?;

        let items_failed = IntCounter::new("settlement_items_failed_total", "Queue items failed")?;
        registry.register(Box::new(items_failed.clone()))?;

        Ok(Self {
            blocks_total,
            events_total,
            chain_length,
            append_duration,
            items_extracted,
            items_settled,
            items_failed,
            registry,
        })
    }

    /// Record an appended block
    pub fn record_block_appended(&self, event_count: usize, chain_length: usize, duration_seconds: f64) {
        self.blocks_total.inc();
        self.events_total.inc_by(event_count as u64);
        self.chain_length.set(chain_length as i64);
        self.append_duration.observe(duration_seconds);
    }

    /// Set chain length (after load)
    pub fn set_chain_length(&self, chain_length: usize) {
        self.chain_length.set(chain_length as i64);
    }

    /// Record queue items created by extraction
    pub fn record_extracted(&self, count: usize) {
        self.items_extracted.inc_by(count as u64);
    }

    /// Record a completed queue item
    pub fn record_settled(&self) {
        self.items_settled.inc();
    }

    /// Record a failed queue item
    pub fn record_failed(&self) {
        self.items_failed.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
