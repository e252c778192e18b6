//! A per-emission registry of metrics.
//!
//! Every scrape builds its metric set from scratch: metrics are created and
//! registered on demand, filled from the current snapshot pair, encoded and
//! dropped. Nothing persists between emissions, so conditional metrics (the
//! replication set differs between primary and standby) simply are not
//! created when they do not apply, and stale label sets cannot linger.

use std::collections::HashMap;

use anyhow::Result;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder};

pub struct MetricSet {
    registry: Registry,
}

impl MetricSet {
    /// Create an empty set. Static labels are attached to the registry so
    /// they apply to every metric registered afterwards.
    pub fn new(static_labels: &HashMap<String, String>) -> Result<Self> {
        let registry = if static_labels.is_empty() {
            Registry::new()
        } else {
            Registry::new_custom(None, Some(static_labels.clone()))?
        };
        Ok(Self { registry })
    }

    pub fn gauge(&self, name: &str, help: &str) -> Result<Gauge> {
        let gauge = Gauge::with_opts(Opts::new(name, help))?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }

    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
        let vec = GaugeVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(vec.clone()))?;
        Ok(vec)
    }

    pub fn counter(&self, name: &str, help: &str) -> Result<IntCounter> {
        let counter = IntCounter::with_opts(Opts::new(name, help))?;
        self.registry.register(Box::new(counter.clone()))?;
        Ok(counter)
    }

    /// Render the set in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Record a sampled absolute value on a freshly created counter.
pub fn set_counter(counter: &IntCounter, value: i64) {
    counter.inc_by(u64::try_from(value).unwrap_or_default());
}
