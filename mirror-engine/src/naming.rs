//! Naming convention for entries in the shared backup root.
//!
//! Snapshots are directories named `{yyyy-MM-dd_HHmm}_{machine}` and lock
//! markers are files named `{yyyy-MM-dd_HHmm}_{machine}.lockfile`. Timestamps
//! are UTC so that names written by different machines sort lexically in
//! chronological order at minute granularity.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M";
pub const LOCK_SUFFIX: &str = ".lockfile";

/// Width of a formatted timestamp, e.g. `2024-03-01_0930`.
const TIMESTAMP_LEN: usize = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid machine name: {0:?}")]
pub struct InvalidMachineId(pub String);

/// Stable identifier of a machine writing into the shared root.
///
/// Path separators are replaced so the identifier can be embedded in a
/// single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    pub fn new(raw: &str) -> Result<Self, InvalidMachineId> {
        let cleaned: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '-',
                c => c,
            })
            .collect();

        if cleaned.is_empty()
            || cleaned.chars().any(char::is_control)
            || cleaned.ends_with(LOCK_SUFFIX)
            || cleaned == "."
            || cleaned == ".."
        {
            return Err(InvalidMachineId(raw.to_string()));
        }

        Ok(Self(cleaned))
    }

    /// Placeholder owner for markers whose name does not follow the convention.
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Components recovered from a stamped entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedName {
    pub created_at: DateTime<Utc>,
    pub machine: MachineId,
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Truncate to the minute, the resolution names can carry.
pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    parse_timestamp(&format_timestamp(at)).unwrap_or(at)
}

pub fn snapshot_name(machine: &MachineId, at: DateTime<Utc>) -> String {
    format!("{}_{}", format_timestamp(at), machine)
}

pub fn lock_name(machine: &MachineId, at: DateTime<Utc>) -> String {
    format!("{}_{}{}", format_timestamp(at), machine, LOCK_SUFFIX)
}

pub fn is_lock_name(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX)
}

pub fn parse_snapshot_name(name: &str) -> Option<StampedName> {
    if is_lock_name(name) {
        return None;
    }
    parse_stamped(name)
}

pub fn parse_lock_name(name: &str) -> Option<StampedName> {
    parse_stamped(name.strip_suffix(LOCK_SUFFIX)?)
}

fn parse_stamped(name: &str) -> Option<StampedName> {
    let stamp = name.get(..TIMESTAMP_LEN)?;
    let machine = name.get(TIMESTAMP_LEN..)?.strip_prefix('_')?;

    Some(StampedName {
        created_at: parse_timestamp(stamp)?,
        machine: MachineId::new(machine).ok()?,
    })
}
