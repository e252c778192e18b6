//! Numeric and boolean server settings from `pg_settings`.

use anyhow::Result;
use sqlx::{PgPool, Row};
use tracing::warn;

/// Hard cap on the query text size requested from the server, regardless of
/// `track_activity_query_size`.
pub const HARD_QUERY_SIZE_LIMIT: i64 = 4096;

#[derive(Clone, Debug, PartialEq)]
pub struct Setting {
    pub name: String,
    pub unit: String,
    pub value: f64,
}

pub async fn fetch_settings(pool: &PgPool) -> Result<Vec<Setting>> {
    let rows = sqlx::query(
        "SELECT name, setting, unit, vartype FROM pg_settings WHERE vartype IN ('integer', 'real', 'bool')",
    )
    .fetch_all(pool)
    .await?;

    let mut res = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = match row.try_get(0) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to scan pg_settings row: {e}");
                continue;
            }
        };
        let setting: String = match row.try_get(1) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to scan pg_settings row: {e}");
                continue;
            }
        };
        let unit: Option<String> = row.try_get(2).unwrap_or_default();
        let vartype: String = row.try_get(3).unwrap_or_default();

        let value = match vartype.as_str() {
            "integer" | "real" => match setting.parse::<f64>() {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to parse value for {name}={setting} setting: {e}");
                    continue;
                }
            },
            "bool" => {
                if setting == "on" {
                    1.0
                } else {
                    0.0
                }
            }
            _ => continue,
        };
        res.push(Setting {
            name,
            unit: unit.unwrap_or_default(),
            value,
        });
    }
    Ok(res)
}

/// Effective query text limit: `track_activity_query_size` converted to
/// bytes, bounded by [`HARD_QUERY_SIZE_LIMIT`].
pub fn query_size_limit(settings: &[Setting]) -> i64 {
    let mut limit = 0;
    for s in settings {
        if s.name == "track_activity_query_size" {
            limit = match s.unit.as_str() {
                "kB" => s.value as i64 * 1024,
                _ => s.value as i64,
            };
            break;
        }
    }
    if limit == 0 || limit > HARD_QUERY_SIZE_LIMIT {
        HARD_QUERY_SIZE_LIMIT
    } else {
        limit
    }
}
