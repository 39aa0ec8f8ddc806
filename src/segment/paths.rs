//! Filename conventions for the three files that make up one segment.
//!
//! Segment filenames are plain decimal, never zero-padded, e.g. segment
//! 7's log file is `7.log`.

use std::path::{Path, PathBuf};

pub fn segment_filename(segment_id: u64) -> String {
    segment_id.to_string()
}

pub fn log_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id}.log"))
}

pub fn trimmed_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id}.log.trimmed"))
}

pub fn pending_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id}.log.pending"))
}

pub fn copy_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{segment_id}.log.copy"))
}

/// Parse a segment id back out of a `<id>.log` filename, if that's what it is.
pub fn parse_segment_id(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(".log")?.parse().ok()
}
