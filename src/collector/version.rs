//! Tolerant parsing of the server's `server_version` setting.
//!
//! Distribution builds report strings like `14.4 (Ubuntu 14.4-1.pgdg18.04+1)`
//! or `11.2-YB-2.15.0.1-b0`; the parser keeps the first token verbatim for
//! the `pg_info` metric and derives a comparable version from the leading
//! `major[.minor[.patch]]` digits.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;

static TRIM_VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.].*").expect("trim regex"));

/// Parse a raw `server_version` value into the original version token and a
/// comparable [`Version`].
pub fn parse_pg_version(raw: &str) -> Result<(String, Version)> {
    let original = raw.split_whitespace().next().unwrap_or_default().to_string();
    let trimmed = TRIM_VERSION_RE.replace(raw, "");
    let version = parse_tolerant(&trimmed)
        .with_context(|| format!("failed to parse server version {raw:?}"))?;
    Ok((original, version))
}

/// Parse `major[.minor[.patch]]`, padding missing components with zero.
fn parse_tolerant(v: &str) -> Result<Version> {
    let parts: Vec<&str> = v.trim().split('.').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() || parts.len() > 3 {
        bail!("invalid version string {v:?}");
    }
    let mut nums = [0u64; 3];
    for (part, num) in parts.iter().zip(nums.iter_mut()) {
        *num = part
            .parse()
            .with_context(|| format!("invalid version component {part:?}"))?;
    }
    Ok(Version::new(nums[0], nums[1], nums[2]))
}
