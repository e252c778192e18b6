//! Cumulative per-statement counters from `pg_stat_statements`.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use semver::Version;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::obfuscate;

/// Identity of one `pg_stat_statements` row: the server-assigned statement
/// hash plus the database and role it ran under. Stable across scrapes while
/// the server retains the row.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatementId {
    pub id: i64,
    pub db: String,
    pub user: String,
}

#[derive(Clone, Debug, Default)]
pub struct StatementRow {
    /// Fingerprinted statement text, computed once per [`StatementId`].
    pub query: String,
    pub calls: i64,
    /// Cumulative execution time in milliseconds.
    pub total_time: f64,
    /// Cumulative I/O time in milliseconds.
    pub io_time: f64,
}

#[derive(Clone, Debug)]
pub struct StatementsSnapshot {
    pub ts: DateTime<Utc>,
    pub rows: HashMap<StatementId, StatementRow>,
}

/// One row as returned by the statements query, before validation.
#[derive(Clone, Debug, Default)]
pub struct StatementRecord {
    pub db: Option<String>,
    pub user: Option<String>,
    pub query: Option<String>,
    pub query_id: Option<i64>,
    pub calls: Option<i64>,
    pub total_time: Option<f64>,
    pub io_time: Option<f64>,
}

/// Build the dialect-specific statements query.
///
/// Version 13 split execution time into plan and exec components; version 17
/// split I/O timing into shared, local and temp counters.
pub fn statements_query(version: &Version, query_size_limit: i64) -> Result<String> {
    let counters = if *version >= Version::new(17, 0, 0) {
        "s.total_plan_time + s.total_exec_time, \
         s.shared_blk_read_time + s.shared_blk_write_time + \
         s.local_blk_read_time + s.local_blk_write_time + \
         s.temp_blk_read_time + s.temp_blk_write_time"
    } else if *version >= Version::new(13, 0, 0) {
        "s.total_plan_time + s.total_exec_time, s.blk_read_time + s.blk_write_time"
    } else if *version >= Version::new(9, 4, 0) {
        "s.total_time, s.blk_read_time + s.blk_write_time"
    } else {
        bail!("postgres version {version} is not supported");
    };
    Ok(format!(
        "SELECT d.datname, r.rolname, LEFT(s.query, {query_size_limit}), s.queryid, s.calls, {counters} \
         FROM pg_stat_statements s \
         JOIN pg_roles r ON r.oid = s.userid \
         JOIN pg_database d ON d.oid = s.dbid AND NOT d.datistemplate"
    ))
}

impl StatementsSnapshot {
    pub fn new(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            rows: HashMap::new(),
        }
    }

    /// Validate one record and add it to the snapshot. Rows with a null
    /// statement id or an empty database or role are dropped. The fingerprint
    /// is reused from `prev` when the same id was seen on the last scrape.
    pub fn insert(
        &mut self,
        record: StatementRecord,
        prev: Option<&HashMap<StatementId, StatementRow>>,
    ) {
        let Some(id) = record.query_id else { return };
        let db = record.db.unwrap_or_default();
        let user = record.user.unwrap_or_default();
        if db.is_empty() || user.is_empty() {
            return;
        }
        let sid = StatementId { id, db, user };
        let query = match prev.and_then(|rows| rows.get(&sid)) {
            Some(p) => p.query.clone(),
            None => obfuscate::sql(record.query.as_deref().unwrap_or_default()),
        };
        self.rows.insert(
            sid,
            StatementRow {
                query,
                calls: record.calls.unwrap_or_default(),
                total_time: record.total_time.unwrap_or_default(),
                io_time: record.io_time.unwrap_or_default(),
            },
        );
    }
}

pub async fn fetch_stat_statements(
    pool: &PgPool,
    version: &Version,
    query_size_limit: i64,
    prev: Option<&HashMap<StatementId, StatementRow>>,
) -> Result<StatementsSnapshot> {
    let query = statements_query(version, query_size_limit)?;
    let rows = sqlx::query(&query).fetch_all(pool).await?;

    let mut snapshot = StatementsSnapshot::new(Utc::now());
    for row in rows {
        let record = StatementRecord {
            db: row.try_get(0).unwrap_or_default(),
            user: row.try_get(1).unwrap_or_default(),
            query: row.try_get(2).unwrap_or_default(),
            query_id: match row.try_get(3) {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to scan pg_stat_statements row: {e}");
                    continue;
                }
            },
            calls: row.try_get(4).unwrap_or_default(),
            total_time: row.try_get(5).unwrap_or_default(),
            io_time: row.try_get(6).unwrap_or_default(),
        };
        snapshot.insert(record, prev);
    }
    Ok(snapshot)
}
