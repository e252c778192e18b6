//! Per-connection state from `pg_stat_activity`.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use semver::Version;
use sqlx::{PgPool, Row};
use tracing::warn;

use super::summary::QueryKey;
use crate::obfuscate;

#[derive(Clone, Debug, Default)]
pub struct Connection {
    pub pid: i32,
    pub db: String,
    pub user: String,
    /// Fingerprinted query text; blank unless the connection is `active` or
    /// `idle in transaction…`.
    pub query: String,
    pub state: String,
    pub wait_event_type: String,
    pub backend_type: String,
    pub query_start: Option<DateTime<Utc>>,
    pub blocking_pid: Option<i32>,
}

impl Connection {
    pub fn query_key(&self) -> QueryKey {
        QueryKey {
            db: self.db.clone(),
            user: self.user.clone(),
            query: self.query.clone(),
        }
    }

    /// Connections that run client statements, as opposed to autovacuum,
    /// walsender and other auxiliary backends. Versions before 10 report no
    /// backend type at all, so an empty value counts as a client.
    pub fn is_client_backend(&self) -> bool {
        self.backend_type.is_empty() || self.backend_type == "client backend"
    }
}

#[derive(Clone, Debug)]
pub struct ActivitySnapshot {
    /// Server-side clock at the time of the probe.
    pub ts: DateTime<Utc>,
    pub connections: HashMap<i32, Connection>,
}

/// One row as returned by the activity query, before validation.
#[derive(Clone, Debug)]
pub struct ConnectionRecord {
    pub pid: i32,
    pub db: Option<String>,
    pub user: Option<String>,
    pub query: Option<String>,
    pub state: Option<String>,
    pub now: DateTime<Utc>,
    pub query_start: Option<DateTime<Utc>>,
    pub waiting: Option<bool>,
    pub wait_event_type: Option<String>,
    pub backend_type: Option<String>,
    pub blocking_pid: Option<i32>,
}

/// Build the dialect-specific activity query.
///
/// 9.6 replaced the boolean `waiting` column with `wait_event_type` and
/// introduced `pg_blocking_pids()`; 10 added `backend_type`.
pub fn activity_query(version: &Version, query_size_limit: i64) -> Result<String> {
    let columns = if *version >= Version::new(10, 0, 0) {
        "null::boolean, s.wait_event_type, s.backend_type, (pg_blocking_pids(s.pid))[1]"
    } else if *version >= Version::new(9, 6, 0) {
        "null::boolean, s.wait_event_type, null::text, (pg_blocking_pids(s.pid))[1]"
    } else if *version >= Version::new(9, 3, 0) {
        "s.waiting, null::text, null::text, null::integer"
    } else {
        bail!("postgres version {version} is not supported");
    };
    Ok(format!(
        "SELECT s.pid, s.datname, s.usename, LEFT(s.query, {query_size_limit}), s.state, \
         clock_timestamp(), s.query_start, {columns} \
         FROM pg_stat_activity s \
         JOIN pg_database d ON s.datid = d.oid AND NOT d.datistemplate"
    ))
}

impl ActivitySnapshot {
    pub fn new(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            connections: HashMap::new(),
        }
    }

    /// Validate one record and add it to the snapshot. Rows with an empty
    /// database, role or state are dropped. A pre-9.6 `waiting` flag is
    /// folded into a `Lock` wait event; query text survives only for states
    /// that are actually running a statement.
    pub fn insert(&mut self, record: ConnectionRecord) {
        let db = record.db.unwrap_or_default();
        let user = record.user.unwrap_or_default();
        let state = record.state.unwrap_or_default();
        if db.is_empty() || user.is_empty() || state.is_empty() {
            return;
        }
        let mut wait_event_type = record.wait_event_type.unwrap_or_default();
        if record.waiting.unwrap_or_default() {
            wait_event_type = "Lock".to_string();
        }
        let query = if state == "active" || state.starts_with("idle in transaction") {
            obfuscate::sql(record.query.as_deref().unwrap_or_default())
        } else {
            String::new()
        };
        self.ts = record.now;
        self.connections.insert(
            record.pid,
            Connection {
                pid: record.pid,
                db,
                user,
                query,
                state,
                wait_event_type,
                backend_type: record.backend_type.unwrap_or_default(),
                query_start: record.query_start,
                blocking_pid: record.blocking_pid,
            },
        );
    }
}

pub async fn fetch_stat_activity(
    pool: &PgPool,
    version: &Version,
    query_size_limit: i64,
) -> Result<ActivitySnapshot> {
    let query = activity_query(version, query_size_limit)?;
    let rows = sqlx::query(&query).fetch_all(pool).await?;

    let mut snapshot = ActivitySnapshot::new(Utc::now());
    for row in rows {
        let (pid, now) = match (row.try_get(0), row.try_get(5)) {
            (Ok(pid), Ok(now)) => (pid, now),
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to scan pg_stat_activity row: {e}");
                continue;
            }
        };
        snapshot.insert(ConnectionRecord {
            pid,
            db: row.try_get(1).unwrap_or_default(),
            user: row.try_get(2).unwrap_or_default(),
            query: row.try_get(3).unwrap_or_default(),
            state: row.try_get(4).unwrap_or_default(),
            now,
            query_start: row.try_get(6).unwrap_or_default(),
            waiting: row.try_get(7).unwrap_or_default(),
            wait_event_type: row.try_get(8).unwrap_or_default(),
            backend_type: row.try_get(9).unwrap_or_default(),
            blocking_pid: row.try_get(10).unwrap_or_default(),
        });
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(pid: i32, state: &str, query: &str) -> ConnectionRecord {
        ConnectionRecord {
            pid,
            db: Some("app".to_string()),
            user: Some("bob".to_string()),
            query: Some(query.to_string()),
            state: Some(state.to_string()),
            now: Utc::now(),
            query_start: None,
            waiting: None,
            wait_event_type: None,
            backend_type: Some("client backend".to_string()),
            blocking_pid: None,
        }
    }

    #[test]
    fn test_activity_query_per_version_band() {
        let q = activity_query(&Version::new(9, 5, 0), 4096).unwrap();
        assert!(q.contains("s.waiting"));
        assert!(!q.contains("wait_event_type"));
        assert!(!q.contains("pg_blocking_pids"));

        let q = activity_query(&Version::new(9, 6, 5), 4096).unwrap();
        assert!(q.contains("s.wait_event_type"));
        assert!(!q.contains("backend_type"));
        assert!(q.contains("(pg_blocking_pids(s.pid))[1]"));

        let q = activity_query(&Version::new(10, 0, 0), 1024).unwrap();
        assert!(q.contains("s.wait_event_type"));
        assert!(q.contains("s.backend_type"));
        assert!(q.contains("LEFT(s.query, 1024)"));

        assert!(activity_query(&Version::new(9, 2, 0), 4096).is_err());
    }

    #[test]
    fn test_insert_drops_incomplete_rows() {
        let mut snapshot = ActivitySnapshot::new(Utc::now());

        let mut no_db = record(1, "active", "SELECT 1");
        no_db.db = None;
        snapshot.insert(no_db);

        let mut no_state = record(2, "", "SELECT 1");
        no_state.state = None;
        snapshot.insert(no_state);

        assert!(snapshot.connections.is_empty());
    }

    #[test]
    fn test_insert_keeps_query_only_for_running_states() {
        let mut snapshot = ActivitySnapshot::new(Utc::now());
        snapshot.insert(record(1, "active", "SELECT 1"));
        snapshot.insert(record(2, "idle in transaction", "SELECT 2"));
        snapshot.insert(record(3, "idle in transaction (aborted)", "SELECT 3"));
        snapshot.insert(record(4, "idle", "SELECT 4"));

        assert_eq!(snapshot.connections[&1].query, "select ?");
        assert_eq!(snapshot.connections[&2].query, "select ?");
        assert_eq!(snapshot.connections[&3].query, "select ?");
        assert_eq!(snapshot.connections[&4].query, "");
    }

    #[test]
    fn test_insert_synthesises_lock_wait_for_old_waiting_flag() {
        let mut snapshot = ActivitySnapshot::new(Utc::now());
        let mut rec = record(1, "active", "SELECT 1");
        rec.waiting = Some(true);
        rec.wait_event_type = None;
        rec.backend_type = None;
        snapshot.insert(rec);

        let conn = &snapshot.connections[&1];
        assert_eq!(conn.wait_event_type, "Lock");
        // pre-10 servers report no backend type; still client-attributable
        assert!(conn.is_client_backend());
    }

    #[test]
    fn test_is_client_backend() {
        let mut conn = Connection {
            backend_type: "client backend".to_string(),
            ..Default::default()
        };
        assert!(conn.is_client_backend());
        conn.backend_type = String::new();
        assert!(conn.is_client_backend());
        conn.backend_type = "autovacuum worker".to_string();
        assert!(!conn.is_client_backend());
    }
}
