//! src/store.rs
//!
//! The State Store: durable snapshots of `MemberState` on local disk.
//! Filenames are timestamped (`membership.<UTC YYYYMMDDhhmmss>`); files
//! accumulate and the newest timestamp wins on read, per spec §4.5.

use crate::error::{Error, Result};
use crate::member_state::MemberState;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const FILE_PREFIX: &str = "membership.";

/// Durable, append-only snapshot directory for one node's `MemberState`.
#[derive(Clone)]
pub struct StateStore {
    data_dir: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Writes a new timestamped snapshot. Creates the data directory if
    /// it doesn't exist yet.
    pub fn write(&self, state: &MemberState) -> Result<PathBuf> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(format!("{}{}", FILE_PREFIX, utc_timestamp()));
        let bytes = bincode::serialize(state)?;
        fs::write(&path, bytes)?;
        tracing::debug!(path = %path.display(), "persisted membership snapshot");
        Ok(path)
    }

    /// Reads the newest valid snapshot in the data directory. Any failure
    /// to find or parse one is reported as "no prior state" to the caller
    /// per spec §4.5/§7 (`bad_mem_state_file` / `mem_state_file_not_found`).
    pub fn read(&self) -> Result<MemberState> {
        let newest = self.newest_snapshot_path()?;
        let bytes = fs::read(&newest).map_err(|_| Error::BadMemStateFile)?;
        bincode::deserialize(&bytes).map_err(|_| Error::BadMemStateFile)
    }

    fn newest_snapshot_path(&self) -> Result<PathBuf> {
        let dir = fs::read_dir(&self.data_dir).map_err(|_| Error::MemStateFileNotFound)?;

        let mut best: Option<(u64, PathBuf)> = None;
        for entry in dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(digits) = name.strip_prefix(FILE_PREFIX) else {
                continue;
            };
            let Ok(timestamp) = digits.parse::<u64>() else {
                continue;
            };
            if best.as_ref().map(|(t, _)| timestamp > *t).unwrap_or(true) {
                best = Some((timestamp, path));
            }
        }

        best.map(|(_, path)| path).ok_or(Error::MemStateFileNotFound)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Formats the current UTC time as `YYYYMMDDhhmmss` without pulling in a
/// date/time crate — the format only needs calendar arithmetic over a UTC
/// civil date, which fits in a few lines via the well-known Howard Hinnant
/// `civil_from_days` algorithm.
fn utc_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX_EPOCH");
    let secs = now.as_secs();
    let (year, month, day) = civil_from_days((secs / 86400) as i64);
    let rem = secs % 86400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    format!(
        "{year:04}{month:02}{day:02}{hour:02}{minute:02}{second:02}"
    )
}

/// Converts a day count since the UNIX epoch into a (year, month, day)
/// civil (Gregorian) date. Standard public-domain algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if m <= 2 { y + 1 } else { y };
    (year, m, d)
}
