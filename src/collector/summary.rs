//! Per-query summaries derived from the snapshot pair.
//!
//! `pg_stat_statements` only moves when a statement completes, while
//! `pg_stat_activity` shows what is running right now. The reconciler fuses
//! both: counter deltas provide the completed work, in-flight connections
//! are credited for the part of the interval they have been executing, and
//! a correction step removes the tail of queries that finished between
//! snapshots and were therefore visible in both sources.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::activity::{ActivitySnapshot, Connection};
use super::statements::{StatementRow, StatementsSnapshot};

/// Identity of a metric series about one logical statement.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey {
    pub db: String,
    pub user: String,
    pub query: String,
}

impl QueryKey {
    /// True when both keys name the same (db, user) and `other`'s query text
    /// is a prefix of this key's fingerprint. Used to match truncated
    /// activity text against its longer fingerprinted form.
    pub fn matches_by_prefix(&self, other: &QueryKey) -> bool {
        self.db == other.db && self.user == other.user && self.query.starts_with(&other.query)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct QuerySummary {
    pub queries: f64,
    /// Seconds of execution time over the interval.
    pub total_time: f64,
    /// Seconds spent awaiting I/O over the interval.
    pub io_time: f64,
}

impl QuerySummary {
    /// Credit the delta between two cumulative statement rows. Any negative
    /// component means the server reset its counters; the row contributes
    /// nothing for this interval.
    fn update_from_statements(&mut self, curr: &StatementRow, prev: &StatementRow) {
        let calls = (curr.calls - prev.calls) as f64;
        let total_time = (curr.total_time - prev.total_time) / 1000.0;
        let io_time = (curr.io_time - prev.io_time) / 1000.0;
        if calls < 0.0 || total_time < 0.0 || io_time < 0.0 {
            return;
        }
        self.queries += calls;
        self.total_time += total_time;
        self.io_time += io_time;
    }

    /// Credit an in-flight connection for the part of the interval it has
    /// been executing, capped at the interval so long-running queries are
    /// not counted twice across scrapes.
    fn update_from_activity(&mut self, prev_ts: DateTime<Utc>, ts: DateTime<Utc>, conn: &Connection) {
        if conn.state != "active" {
            return;
        }
        let Some(query_start) = conn.query_start else {
            return;
        };
        let mut duration = duration_seconds(ts - query_start);
        if duration < 0.0 {
            return;
        }
        let interval = duration_seconds(ts - prev_ts);
        if duration > interval {
            duration = interval;
        }
        if conn.is_client_backend() {
            self.queries += 1.0;
            self.total_time += duration;
        }
        if conn.wait_event_type == "IO" {
            self.io_time += duration;
        }
    }

    /// Remove the credit given to a query that was in flight on the previous
    /// scrape and has since completed: its full duration now shows up in the
    /// statements delta. Only subtract when the summary still exceeds the
    /// duration, otherwise the statements delta has already absorbed it.
    fn correct_from_prev_activity(&mut self, prev_ts: DateTime<Utc>, conn: &Connection) {
        let Some(query_start) = conn.query_start else {
            return;
        };
        let duration = duration_seconds(prev_ts - query_start);
        if duration < 0.0 {
            return;
        }
        if conn.is_client_backend() && self.queries > 0.0 && self.total_time > duration {
            self.queries -= 1.0;
            self.total_time -= duration;
        }
        if conn.wait_event_type == "IO" && self.io_time > duration {
            self.io_time -= duration;
        }
    }
}

pub(crate) fn duration_seconds(d: chrono::Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

/// Resolve the summary key a connection should be credited to: an exact
/// match first, then the fingerprint the connection's (possibly truncated)
/// text is a prefix of. The map is ordered, so when several fingerprints
/// share the prefix the lexicographically smallest wins every time.
fn summary_key(summaries: &BTreeMap<QueryKey, QuerySummary>, key: &QueryKey) -> QueryKey {
    if summaries.contains_key(key) {
        return key.clone();
    }
    for existing in summaries.keys() {
        if existing.matches_by_prefix(key) {
            return existing.clone();
        }
    }
    key.clone()
}

/// Derive per-key summaries for the interval between the two retained
/// snapshot pairs, and the interval itself.
pub fn reconcile(
    ss_prev: &StatementsSnapshot,
    ss_curr: &StatementsSnapshot,
    sa_prev: &ActivitySnapshot,
    sa_curr: &ActivitySnapshot,
) -> (BTreeMap<QueryKey, QuerySummary>, chrono::Duration) {
    let mut summaries: BTreeMap<QueryKey, QuerySummary> = BTreeMap::new();

    // completed work: deltas for every id present in both snapshots
    for (id, row) in &ss_curr.rows {
        let Some(prev) = ss_prev.rows.get(id) else {
            continue;
        };
        let key = QueryKey {
            db: id.db.clone(),
            user: id.user.clone(),
            query: row.query.clone(),
        };
        summaries
            .entry(key)
            .or_default()
            .update_from_statements(row, prev);
    }

    // in-flight credit from current activity
    for conn in sa_curr.connections.values() {
        let key = summary_key(&summaries, &conn.query_key());
        summaries
            .entry(key)
            .or_default()
            .update_from_activity(sa_prev.ts, sa_curr.ts, conn);
    }

    // completion correction for queries that were running on the previous
    // scrape and have finished or been replaced since
    for (pid, prev_conn) in &sa_prev.connections {
        if !prev_conn.is_client_backend() || prev_conn.state != "active" {
            continue;
        }
        if let Some(curr_conn) = sa_curr.connections.get(pid) {
            if curr_conn.state == "active" && curr_conn.query_start == prev_conn.query_start {
                // still executing
                continue;
            }
        }
        let key = summary_key(&summaries, &prev_conn.query_key());
        summaries
            .entry(key)
            .or_default()
            .correct_from_prev_activity(sa_prev.ts, prev_conn);
    }

    (summaries, ss_curr.ts - ss_prev.ts)
}

/// The `n` summaries with the largest total time.
pub fn top(
    summaries: &BTreeMap<QueryKey, QuerySummary>,
    n: usize,
) -> Vec<(&QueryKey, &QuerySummary)> {
    let mut items: Vec<_> = summaries.iter().collect();
    items.sort_by(|a, b| {
        b.1.total_time
            .partial_cmp(&a.1.total_time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    items.truncate(n);
    items
}
