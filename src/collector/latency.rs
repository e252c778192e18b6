//! Percentile estimation over (average, count) batches.
//!
//! Only per-statement aggregates are retained, never individual samples, so
//! memory stays bounded by the number of distinct statements while the
//! batch-weighted quantile remains accurate enough for dashboards.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
struct Batch {
    avg: f64,
    events: u64,
}

#[derive(Clone, Debug, Default)]
pub struct LatencySummary {
    total_events: u64,
    total_time: f64,
    batches: Vec<Batch>,
}

impl LatencySummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch of `events` with the given combined time. Zero-event
    /// batches are no-ops.
    pub fn add(&mut self, total_time: f64, events: u64) {
        if events == 0 {
            return;
        }
        self.total_events += events;
        self.total_time += total_time;
        self.batches.push(Batch {
            avg: total_time / events as f64,
            events,
        });
    }

    /// Compute `avg`, `max` and the requested percentiles, keyed as `avg`,
    /// `max` and `p<percentile>`. A percentile outside `(0, 100]` makes the
    /// whole call return the empty map.
    pub fn get_summaries(&mut self, percentiles: &[f64]) -> HashMap<String, f64> {
        let mut res = HashMap::new();
        if self.batches.is_empty() || percentiles.is_empty() {
            return res;
        }
        self.batches
            .sort_by(|a, b| a.avg.partial_cmp(&b.avg).unwrap_or(std::cmp::Ordering::Equal));

        res.insert("avg".to_string(), self.total_time / self.total_events as f64);
        if let Some(last) = self.batches.last() {
            res.insert("max".to_string(), last.avg);
        }

        for &p in percentiles {
            let q = p / 100.0;
            if q <= 0.0 || q > 1.0 {
                return HashMap::new();
            }
            let idx = (self.total_events as f64 * q) as u64;
            let mut counter = 0;
            for batch in &self.batches {
                counter += batch.events;
                if counter >= idx {
                    res.insert(format!("p{p}"), batch.avg);
                    break;
                }
            }
        }
        res
    }
}
