//! Segment cache: lazily opens segments on first use and keeps them
//! resident behind an `Arc` until evicted. Eviction (triggered by trim or
//! compaction replacing a segment's files on disk) must not yank a file
//! out from under a reader mid-scan, so a segment with outstanding
//! references is marked "condemned" instead of closed immediately; the
//! last `release()` to see `ref_count == 0` on a condemned segment performs
//! the deferred close.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::segment::Segment;

pub struct SegmentCache {
    dir: PathBuf,
    config: EngineConfig,
    segments: Mutex<HashMap<u64, Arc<Segment>>>,
}

impl SegmentCache {
    pub fn new(dir: PathBuf, config: EngineConfig) -> Self {
        Self {
            dir,
            config,
            segments: Mutex::new(HashMap::new()),
        }
    }

    /// Get the segment for `segment_id`, opening (and scanning) it if this
    /// is the first use. Returns a retained handle; callers must `release`
    /// it exactly once.
    pub fn get(&self, segment_id: u64) -> Result<Arc<Segment>> {
        let mut segments = self.segments.lock().unwrap();
        if let Some(segment) = segments.get(&segment_id) {
            segment.retain();
            return Ok(segment.clone());
        }
        let segment = Arc::new(Segment::open(&self.dir, segment_id, &self.config)?);
        segment.retain();
        segments.insert(segment_id, segment.clone());
        Ok(segment)
    }

    /// Release a handle obtained from `get`. If this was the last reference
    /// to a condemned segment, closes it for real.
    pub fn release(&self, segment: &Arc<Segment>) -> Result<()> {
        let last = segment.release()?;
        if last && segment.is_condemned() {
            segment.close()?;
        }
        Ok(())
    }

    /// Evict `segment_id`'s cached handle, e.g. because its on-disk files
    /// were just replaced by a compaction. If nobody else holds it, closes
    /// it immediately; otherwise marks it condemned so the last holder's
    /// `release` closes it, and a subsequent `get` opens a fresh handle
    /// against the new files.
    pub fn evict(&self, segment_id: u64) -> Result<()> {
        let mut segments = self.segments.lock().unwrap();
        let Some(segment) = segments.remove(&segment_id) else {
            return Ok(());
        };
        if segment.ref_count() == 0 {
            segment.close()?;
        } else {
            log::warn!(
                "evicting segment {segment_id} with {} outstanding reader(s); deferring close",
                segment.ref_count()
            );
            segment.condemn();
        }
        Ok(())
    }

    pub fn resident_count(&self) -> usize {
        self.segments.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reuses_open_segment() {
        let dir = tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().to_path_buf(), EngineConfig::default());
        let a = cache.get(0).unwrap();
        let b = cache.get(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        cache.release(&a).unwrap();
        cache.release(&b).unwrap();
    }

    #[test]
    fn evict_with_no_readers_closes_immediately() {
        let dir = tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().to_path_buf(), EngineConfig::default());
        let handle = cache.get(0).unwrap();
        cache.release(&handle).unwrap();
        drop(handle);

        cache.evict(0).unwrap();
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn evict_with_outstanding_reader_defers_close() {
        let dir = tempdir().unwrap();
        let cache = SegmentCache::new(dir.path().to_path_buf(), EngineConfig::default());
        let reader = cache.get(0).unwrap();

        cache.evict(0).unwrap();
        assert!(reader.is_condemned());
        assert_eq!(cache.resident_count(), 0);

        // The reader's own release performs the deferred close.
        cache.release(&reader).unwrap();
    }
}
