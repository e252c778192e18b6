//! The snapshot-and-delta engine.
//!
//! A background task interrogates the server's statistics views on a fixed
//! interval and publishes immutable snapshots; the metric emitter reads the
//! two most recent snapshots on every external scrape and derives per-query
//! summaries from them. The snapshot pair is the only hand-off between the
//! two sides: the scheduler holds the writer lock for a whole cycle, the
//! emitter holds the reader lock for one emission, and a new
//! statements/activity pair is published only when both probes succeeded.

pub mod activity;
pub mod latency;
pub mod metrics;
pub mod replication;
pub mod settings;
pub mod statements;
pub mod summary;
pub mod version;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection as _, PgPool};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use activity::ActivitySnapshot;
use latency::LatencySummary;
use metrics::MetricSet;
use replication::ReplicationStatus;
use settings::Setting;
use statements::StatementsSnapshot;
use summary::{duration_seconds, QueryKey, QuerySummary};

const TOP_QUERIES_N: usize = 20;

#[derive(Default)]
struct State {
    orig_version: String,
    settings: Vec<Setting>,
    replication: Option<ReplicationStatus>,
    scrape_errors: BTreeSet<String>,
    ss_curr: Option<StatementsSnapshot>,
    ss_prev: Option<StatementsSnapshot>,
    sa_curr: Option<ActivitySnapshot>,
    sa_prev: Option<ActivitySnapshot>,
}

pub struct Collector {
    pool: PgPool,
    state: RwLock<State>,
    static_labels: HashMap<String, String>,
    cancel: CancellationToken,
}

impl Collector {
    /// Connect to the server and start the snapshot scheduler.
    ///
    /// The pool is capped at a single connection so probe queries serialise
    /// on the server side. An unreachable server at startup is only a
    /// warning; the agent serves `pg_up 0` until the server appears.
    pub async fn new(
        dsn: &SecretString,
        scrape_interval: Duration,
        static_labels: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(dsn.expose_secret())?;

        let collector = Arc::new(Self {
            pool,
            state: RwLock::new(State::default()),
            static_labels,
            cancel: CancellationToken::new(),
        });

        if let Err(e) = collector.ping().await {
            warn!("probe failed: {e}");
        }

        let c = Arc::clone(&collector);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scrape_interval);
            // a cycle that overruns its period skips ticks instead of piling up
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => c.snapshot().await,
                    () = c.cancel.cancelled() => {
                        info!("stopping snapshot scheduler");
                        return;
                    }
                }
            }
        });

        Ok(collector)
    }

    /// Stop the scheduler and close the connection pool. In-flight SQL is
    /// allowed to finish its current cycle.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.pool.close().await;
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    /// One snapshot cycle. Holds the writer lock for its whole duration.
    async fn snapshot(&self) {
        let mut state = self.state.write().await;

        state.scrape_errors.clear();
        state.orig_version.clear();

        let raw_version = match sqlx::query_scalar::<_, String>(
            "SELECT setting FROM pg_settings WHERE name='server_version'",
        )
        .fetch_one(&self.pool)
        .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!("{e}");
                state.scrape_errors.insert(e.to_string());
                return;
            }
        };
        let pg_version = match version::parse_pg_version(&raw_version) {
            Ok((orig, v)) => {
                state.orig_version = orig;
                v
            }
            Err(e) => {
                warn!("{e}");
                state.scrape_errors.insert(e.to_string());
                return;
            }
        };

        match settings::fetch_settings(&self.pool).await {
            Ok(s) => state.settings = s,
            Err(e) => {
                warn!("{e}");
                state.scrape_errors.insert(e.to_string());
            }
        }
        match replication::fetch_replication_status(&self.pool, &pg_version).await {
            Ok(rs) => state.replication = Some(rs),
            Err(e) => {
                warn!("{e}");
                state.scrape_errors.insert(e.to_string());
            }
        }

        let query_size_limit = settings::query_size_limit(&state.settings);

        let new_ss = {
            let prev_rows = state.ss_curr.as_ref().map(|s| &s.rows);
            statements::fetch_stat_statements(&self.pool, &pg_version, query_size_limit, prev_rows)
                .await
        };
        let new_ss = match new_ss {
            Ok(s) => s,
            Err(e) => {
                warn!("{e}");
                state.scrape_errors.insert(e.to_string());
                return;
            }
        };
        let new_sa = match activity::fetch_stat_activity(&self.pool, &pg_version, query_size_limit)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!("{e}");
                state.scrape_errors.insert(e.to_string());
                return;
            }
        };

        // both probes succeeded: rotate and publish atomically
        state.ss_prev = state.ss_curr.take();
        state.ss_curr = Some(new_ss);
        state.sa_prev = state.sa_curr.take();
        state.sa_curr = Some(new_sa);
    }

    /// Render the full exposition payload for one external scrape.
    pub async fn render_metrics(&self) -> Result<String> {
        let set = MetricSet::new(&self.static_labels)?;
        let up = set.gauge("pg_up", "Is the server reachable")?;

        let started = Instant::now();
        if let Err(e) = self.ping().await {
            warn!("probe failed: {e}");
            up.set(0.0);
            let scrape_error = set.gauge_vec("pg_scrape_error", "Scrape error", &["error", "warning"])?;
            scrape_error
                .with_label_values(&[e.to_string().as_str(), ""])
                .set(1.0);
            return set.encode();
        }
        up.set(1.0);
        set.gauge("pg_probe_seconds", "Empty query execution time")?
            .set(started.elapsed().as_secs_f64());

        set.gauge_vec("pg_agent_info", "Agent info", &["version"])?
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        let state = self.state.read().await;

        if !state.orig_version.is_empty() {
            set.gauge_vec("pg_info", "Server info", &["server_version"])?
                .with_label_values(&[state.orig_version.as_str()])
                .set(1.0);
        }

        let scrape_error = set.gauge_vec("pg_scrape_error", "Scrape error", &["error", "warning"])?;
        if state.scrape_errors.is_empty() {
            scrape_error.with_label_values(&["", ""]).set(0.0);
        } else {
            for e in &state.scrape_errors {
                scrape_error.with_label_values(&["", e]).set(1.0);
            }
        }

        connection_metrics(&set, &state)?;
        query_metrics(&set, &state)?;

        let settings = set.gauge_vec(
            "pg_setting",
            "Value of the pg_setting variable",
            &["name", "unit"],
        )?;
        for s in &state.settings {
            settings
                .with_label_values(&[s.name.as_str(), s.unit.as_str()])
                .set(s.value);
        }

        replication_metrics(&set, &state)?;

        set.encode()
    }
}

fn summaries(state: &State) -> Option<(BTreeMap<QueryKey, QuerySummary>, chrono::Duration)> {
    Some(summary::reconcile(
        state.ss_prev.as_ref()?,
        state.ss_curr.as_ref()?,
        state.sa_prev.as_ref()?,
        state.sa_curr.as_ref()?,
    ))
}

fn connection_metrics(set: &MetricSet, state: &State) -> Result<()> {
    let Some(sa) = state.sa_curr.as_ref() else {
        return Ok(());
    };

    let mut key_by_pid: HashMap<i32, QueryKey> = HashMap::new();
    let mut awaiting_by_blocking_pid: HashMap<i32, f64> = HashMap::new();
    let mut count_by_key: HashMap<(QueryKey, String, String), f64> = HashMap::new();

    for (pid, conn) in &sa.connections {
        let query_key = conn.query_key();
        key_by_pid.insert(*pid, query_key.clone());
        if let Some(blocking_pid) = conn.blocking_pid {
            if blocking_pid > 0 {
                *awaiting_by_blocking_pid.entry(blocking_pid).or_default() += 1.0;
            }
        }
        *count_by_key
            .entry((query_key, conn.state.clone(), conn.wait_event_type.clone()))
            .or_default() += 1.0;
    }

    let connections = set.gauge_vec(
        "pg_connections",
        "Number of database connections",
        &["db", "user", "state", "wait_event_type", "query"],
    )?;
    for ((key, conn_state, wait_event_type), count) in &count_by_key {
        connections
            .with_label_values(&[
                key.db.as_str(),
                key.user.as_str(),
                conn_state.as_str(),
                wait_event_type.as_str(),
                key.query.as_str(),
            ])
            .set(*count);
    }

    let mut awaiting_by_query: BTreeMap<QueryKey, f64> = BTreeMap::new();
    for (blocking_pid, awaiting) in awaiting_by_blocking_pid {
        if let Some(blocking_key) = key_by_pid.get(&blocking_pid) {
            *awaiting_by_query.entry(blocking_key.clone()).or_default() += awaiting;
        }
    }
    let lock_awaiting = set.gauge_vec(
        "pg_lock_awaiting_queries",
        "Number of queries awaiting a lock",
        &["db", "user", "blocking_query"],
    )?;
    for (key, awaiting) in &awaiting_by_query {
        lock_awaiting
            .with_label_values(&[key.db.as_str(), key.user.as_str(), key.query.as_str()])
            .set(*awaiting);
    }
    Ok(())
}

fn query_metrics(set: &MetricSet, state: &State) -> Result<()> {
    let Some((summaries, interval)) = summaries(state) else {
        debug!("snapshot pair not complete yet");
        return Ok(());
    };
    let interval = duration_seconds(interval);
    if interval <= 0.0 {
        return Ok(());
    }

    let mut latency = LatencySummary::new();
    let mut queries_by_db: BTreeMap<String, f64> = BTreeMap::new();
    for (key, summary) in &summaries {
        latency.add(summary.total_time, summary.queries as u64);
        *queries_by_db.entry(key.db.clone()).or_default() += summary.queries;
    }

    let latency_gauge = set.gauge_vec("pg_latency_seconds", "Query execution time", &["summary"])?;
    for (name, value) in latency.get_summaries(&[50.0, 75.0, 95.0, 99.0]) {
        latency_gauge.with_label_values(&[name.as_str()]).set(value);
    }

    let db_queries = set.gauge_vec(
        "pg_db_queries_per_second",
        "Number of queries executed in the database per second",
        &["db"],
    )?;
    for (db, queries) in &queries_by_db {
        db_queries
            .with_label_values(&[db.as_str()])
            .set(queries / interval);
    }

    let top_calls = set.gauge_vec(
        "pg_top_query_calls_per_second",
        "Number of times the query was executed",
        &["db", "user", "query"],
    )?;
    let top_time = set.gauge_vec(
        "pg_top_query_time_per_second",
        "Time spent executing the query",
        &["db", "user", "query"],
    )?;
    let top_io_time = set.gauge_vec(
        "pg_top_query_io_time_per_second",
        "Time the query spent awaiting IO",
        &["db", "user", "query"],
    )?;
    for (key, summary) in summary::top(&summaries, TOP_QUERIES_N) {
        let labels = &[key.db.as_str(), key.user.as_str(), key.query.as_str()];
        top_calls.with_label_values(labels).set(summary.queries / interval);
        top_time
            .with_label_values(labels)
            .set(summary.total_time / interval);
        top_io_time
            .with_label_values(labels)
            .set(summary.io_time / interval);
    }
    Ok(())
}

fn replication_metrics(set: &MetricSet, state: &State) -> Result<()> {
    let Some(rs) = state.replication.as_ref() else {
        return Ok(());
    };
    if rs.is_in_recovery {
        if let Some(lsn) = rs.receive_lsn {
            metrics::set_counter(
                &set.counter(
                    "pg_wal_receive_lsn",
                    "WAL sequence number that has been received and synced to disk by streaming replication",
                )?,
                lsn,
            );
        }
        if let Some(lsn) = rs.reply_lsn {
            metrics::set_counter(
                &set.counter(
                    "pg_wal_reply_lsn",
                    "WAL sequence number that has been replayed during recovery",
                )?,
                lsn,
            );
        }
        set.gauge("pg_wal_replay_paused", "Whether WAL replay paused or not")?
            .set(if rs.is_replay_paused { 1.0 } else { 0.0 });

        let (sender_host, sender_port) = match rs.primary_host_port() {
            Ok(hp) => hp,
            Err(e) => {
                warn!("{e}");
                (String::new(), String::new())
            }
        };
        set.gauge_vec(
            "pg_wal_receiver_status",
            "WAL receiver status: 1 if the receiver is connected, otherwise 0",
            &["sender_host", "sender_port"],
        )?
        .with_label_values(&[sender_host.as_str(), sender_port.as_str()])
        .set(rs.wal_receiver_attached as f64);
    } else if let Some(lsn) = rs.current_lsn {
        metrics::set_counter(
            &set.counter("pg_wal_current_lsn", "Current WAL sequence number")?,
            lsn,
        );
    }
    Ok(())
}
