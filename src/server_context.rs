//! External collaborator interface. The engine asks a [`ServerContext`] for
//! its log directory and persists the two pieces of state that must survive
//! a restart outside of any one segment file: the prefix-trim mark
//! (`starting_address`) and the last segment known to exist (`tail_segment`).
//!
//! A small trait for host-provided configuration rather than reading
//! environment/CLI state directly, so the engine stays testable without a
//! real process environment.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub trait ServerContext: Send + Sync {
    /// Look up a configuration value by key, e.g. `"--log-path"`.
    fn get(&self, key: &str) -> Option<String>;

    fn starting_address(&self) -> Result<u64>;
    fn set_starting_address(&self, address: u64) -> Result<()>;

    fn tail_segment(&self) -> Result<u64>;
    fn set_tail_segment(&self, segment_id: u64) -> Result<()>;
}

/// Default file-backed [`ServerContext`]: stores `starting_address` and
/// `tail_segment` as small decimal files alongside the log segments,
/// fsyncing on every write so a crash can never observe a value older than
/// what was last durably acknowledged to a caller.
pub struct FileServerContext {
    log_path: PathBuf,
}

const STARTING_ADDRESS_FILE: &str = "starting_address";
const TAIL_SEGMENT_FILE: &str = "tail_segment";

impl FileServerContext {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    fn read_u64(&self, file_name: &str, default: u64) -> Result<u64> {
        let path = self.log_path.join(file_name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents.trim().parse().unwrap_or(default)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default),
            Err(e) => Err(e.into()),
        }
    }

    fn write_u64(&self, file_name: &str, value: u64) -> Result<()> {
        fs::create_dir_all(&self.log_path)?;
        let path = self.log_path.join(file_name);
        fs::write(&path, value.to_string())?;
        let file = fs::File::open(&path)?;
        file.sync_all()?;
        Ok(())
    }
}

impl ServerContext for FileServerContext {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            "--log-path" => Some(self.log_path.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    fn starting_address(&self) -> Result<u64> {
        self.read_u64(STARTING_ADDRESS_FILE, 0)
    }

    fn set_starting_address(&self, address: u64) -> Result<()> {
        self.write_u64(STARTING_ADDRESS_FILE, address)
    }

    fn tail_segment(&self) -> Result<u64> {
        self.read_u64(TAIL_SEGMENT_FILE, 0)
    }

    fn set_tail_segment(&self, segment_id: u64) -> Result<()> {
        self.write_u64(TAIL_SEGMENT_FILE, segment_id)
    }
}

impl AsRef<Path> for FileServerContext {
    fn as_ref(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_to_zero_before_any_write() {
        let dir = tempdir().unwrap();
        let ctx = FileServerContext::new(dir.path());
        assert_eq!(ctx.starting_address().unwrap(), 0);
        assert_eq!(ctx.tail_segment().unwrap(), 0);
    }

    #[test]
    fn persists_across_a_new_instance() {
        let dir = tempdir().unwrap();
        {
            let ctx = FileServerContext::new(dir.path());
            ctx.set_starting_address(12345).unwrap();
            ctx.set_tail_segment(7).unwrap();
        }
        let ctx = FileServerContext::new(dir.path());
        assert_eq!(ctx.starting_address().unwrap(), 12345);
        assert_eq!(ctx.tail_segment().unwrap(), 7);
    }

    #[test]
    fn get_exposes_log_path() {
        let dir = tempdir().unwrap();
        let ctx = FileServerContext::new(dir.path());
        assert_eq!(ctx.get("--log-path").unwrap(), dir.path().to_string_lossy());
        assert!(ctx.get("--unknown").is_none());
    }
}
