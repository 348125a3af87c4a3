//! Extraction-cache freshness and timestamp handling.
//!
//! A materialized file is identified as current by its (size, mtime) pair
//! matching the bundle entry. Extraction writes the full content through a
//! temporary name and an atomic rename, and only then stamps the bundle's
//! mtime onto the file: a process killed mid-extraction leaves either no file
//! at the final name or one whose mtime does not match, so the next run
//! extracts again.

use std::fs;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

/// Whether a local file already matches a bundle entry's freshness key.
pub fn is_current(meta: &fs::Metadata, size: u64, mtime: u64) -> bool {
    meta.is_file() && meta.len() == size && mtime_secs(meta) == Some(mtime)
}

/// Modification time of a local file as whole Unix seconds.
pub fn mtime_secs(meta: &fs::Metadata) -> Option<u64> {
    let modified = meta.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs())
}

/// Set a file's modification time to the given Unix seconds.
///
/// Called after the extracted file has been renamed into place.
pub fn stamp_mtime(path: &Path, secs: u64) -> std::io::Result<()> {
    let file = fs::File::options().write(true).open(path)?;
    let when = UNIX_EPOCH + Duration::from_secs(secs);
    file.set_times(fs::FileTimes::new().set_modified(when))
}

/// Convert a zip entry's DOS date-time to Unix seconds.
///
/// Bundles are built with normalized timestamps, so the value is only used as
/// an opaque freshness token; entries without a timestamp map to 0.
pub(crate) fn zip_mtime(dt: Option<zip::DateTime>) -> u64 {
    let Some(dt) = dt else { return 0 };
    let days = days_from_civil(
        i64::from(dt.year()),
        i64::from(dt.month()),
        i64::from(dt.day()),
    );
    let secs = days * 86_400
        + i64::from(dt.hour()) * 3_600
        + i64::from(dt.minute()) * 60
        + i64::from(dt.second());
    secs.max(0) as u64
}

/// Days since 1970-01-01 for a proleptic Gregorian civil date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
