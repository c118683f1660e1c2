//! # Recording path/naming (C12)
//!
//! Pure functions mapping `{root, loop, epoch, id, ext}` to an absolute
//! path and back, per SPEC_FULL.md §4.4: `<root>/<loop>/<loop>_
//! <YYYYMMDDTHH:MM:SS>_<id>.<ext>`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{RecorderError, RecorderResult};

/// Builds the absolute path for a new recording file, creating
/// `<root>/<loop>/` if it does not already exist.
pub fn recording_file_path(
    root: &Path,
    loop_name: &str,
    start_epoch_secs: u64,
    id: Uuid,
    ext: &str,
) -> RecorderResult<PathBuf> {
    let dir = root.join(loop_name);
    std::fs::create_dir_all(&dir)?;
    let stamp = format_timestamp(start_epoch_secs);
    Ok(dir.join(format!("{loop_name}_{stamp}_{id}.{ext}")))
}

/// `YYYYMMDDTHH:MM:SS`, the source's no-separator-in-the-date but
/// colon-separated-time stamp.
fn format_timestamp(epoch_secs: u64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp(epoch_secs as i64, 0).unwrap_or_default();
    dt.format("%Y%m%dT%H:%M:%S").to_string()
}

/// The fields recovered by parsing a recording file's name back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub loop_name: String,
    pub epoch_secs: u64,
    pub id: Uuid,
    pub ext: String,
}

/// Inverse of [`recording_file_path`]'s basename: splits on `_` and `.`.
/// Loop names containing `_` are unsupported by this scheme (the first
/// `_`-delimited field is taken as the whole loop name), matching
/// SPEC_FULL.md §8's round-trip law which is scoped to loop names
/// without `_` or `/`.
pub fn parse_file_name(name: &str) -> RecorderResult<ParsedName> {
    let (stem, ext) = name
        .rsplit_once('.')
        .ok_or_else(|| RecorderError::InvalidPath(name.to_string()))?;
    let mut parts = stem.splitn(3, '_');
    let loop_name = parts.next().ok_or_else(|| RecorderError::InvalidPath(name.to_string()))?;
    let stamp = parts.next().ok_or_else(|| RecorderError::InvalidPath(name.to_string()))?;
    let id_str = parts.next().ok_or_else(|| RecorderError::InvalidPath(name.to_string()))?;

    let epoch_secs = parse_timestamp(stamp).ok_or_else(|| RecorderError::InvalidPath(name.to_string()))?;
    let id = Uuid::parse_str(id_str).map_err(|_| RecorderError::InvalidPath(name.to_string()))?;

    Ok(ParsedName {
        loop_name: loop_name.to_string(),
        epoch_secs,
        id,
        ext: ext.to_string(),
    })
}

fn parse_timestamp(stamp: &str) -> Option<u64> {
    let dt = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H:%M:%S").ok()?;
    Some(dt.and_utc().timestamp().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_formatted_name() {
        let id = Uuid::new_v4();
        let dir = tempfile::tempdir().unwrap();
        let epoch = 1_700_000_000u64;
        let path = recording_file_path(dir.path(), "main", epoch, id, "wav").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        let parsed = parse_file_name(name).unwrap();
        assert_eq!(parsed.loop_name, "main");
        assert_eq!(parsed.epoch_secs, epoch);
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.ext, "wav");
    }

    #[test]
    fn creates_the_loop_directory() {
        let id = Uuid::new_v4();
        let dir = tempfile::tempdir().unwrap();
        let path = recording_file_path(dir.path(), "missing-dir", 1_700_000_000, id, "ogg").unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn rejects_a_name_with_no_extension() {
        assert!(parse_file_name("not-a-valid-name").is_err());
    }
}
