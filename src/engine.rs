//! Engine facade: the single entry point an embedder uses. Wires
//! together the segment cache, the per-segment lock table, the append and
//! trim/compact paths, and a [`ServerContext`] for the two pieces of state
//! that outlive any one segment.
//!
//! Addresses are never assigned here: the caller (in the full system, a
//! sequencer external to this engine) decides what global address a
//! record gets. The facade's job is durably honoring that assignment
//! exactly once, tracking the highest address it has ever accepted, and
//! keeping `tail_segment` in the server context roughly in step with the
//! data on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::append::{self, AppendContext, AppendRequest};
use crate::cache::SegmentCache;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lock::LockTable;
use crate::proto::{DataType, LogEntry, Rank};
use crate::segment::{paths, AddressMetaData, Segment};
use crate::server_context::ServerContext;
use crate::trim::{self, CompactionReport, TrimContext};

/// A fully formed record to append, minus the global address it is destined
/// for — that is supplied separately to [`Engine::append`] /
/// [`Engine::append_batch`].
#[derive(Clone, Default)]
pub struct Record {
    pub data_type: i32,
    pub data: Vec<u8>,
    pub streams: Vec<String>,
    pub backpointers: HashMap<String, u64>,
    pub rank: Option<Rank>,
}

impl Record {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    fn into_request(self, address: u64) -> AppendRequest {
        AppendRequest {
            address,
            data_type: self.data_type,
            data: self.data,
            streams: self.streams,
            backpointers: self.backpointers,
            rank: self.rank,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    /// Highest address ever successfully appended, or `-1` if none.
    pub global_tail: i64,
    pub trim_mark: u64,
    pub tail_segment: u64,
    pub resident_segments: usize,
    pub dirty_segments: usize,
}

pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,
    cache: SegmentCache,
    locks: LockTable,
    server_context: Box<dyn ServerContext>,
    /// Monotonic max over every address ever successfully appended; `-1`
    /// when the log is empty. Advanced with a CAS loop rather than a lock.
    global_tail: AtomicI64,
    last_segment: AtomicU64,
    /// Segment ids with a buffered write not yet forced to durable storage.
    /// `sync(true)` drains this and fsyncs each entry; `sync(false)` just
    /// clears it.
    dirty_segments: Mutex<HashSet<u64>>,
}

impl Engine {
    /// Open the engine rooted at `server_context`'s log path, recovering
    /// `global_tail`/`tail_segment` by scanning the persisted tail segment
    /// and, defensively, the one after it: `tail_segment` persistence is
    /// not atomic with the write that makes it stale, so a crash can leave
    /// it one segment behind.
    pub fn open(config: EngineConfig, server_context: Box<dyn ServerContext>) -> Result<Self> {
        let dir = PathBuf::from(server_context.get("--log-path").unwrap_or_else(|| ".".to_string()));
        std::fs::create_dir_all(&dir)?;

        let starting_address = server_context.starting_address()?;
        let (global_tail, tail_segment) = recover_tail(&dir, &config, server_context.as_ref())?;
        if tail_segment != server_context.tail_segment()? {
            server_context.set_tail_segment(tail_segment)?;
        }

        let engine = Self {
            cache: SegmentCache::new(dir.clone(), config),
            locks: LockTable::new(),
            dir,
            config,
            server_context,
            global_tail: AtomicI64::new(global_tail),
            last_segment: AtomicU64::new(tail_segment),
            dirty_segments: Mutex::new(HashSet::new()),
        };

        if starting_address > 0 && global_tail < starting_address as i64 - 1 {
            engine.sync_tail_segment(starting_address - 1)?;
        }

        Ok(engine)
    }

    fn append_ctx(&self) -> AppendContext<'_> {
        AppendContext {
            cache: &self.cache,
            locks: &self.locks,
            config: &self.config,
        }
    }

    fn trim_ctx(&self) -> TrimContext<'_> {
        TrimContext {
            cache: &self.cache,
            locks: &self.locks,
            config: &self.config,
            dir: &self.dir,
        }
    }

    fn advance_global_tail(&self, address: u64) {
        let address = address as i64;
        let mut current = self.global_tail.load(Ordering::SeqCst);
        while address > current {
            match self
                .global_tail
                .compare_exchange(current, address, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn mark_dirty(&self, segment_id: u64) {
        self.dirty_segments.lock().unwrap().insert(segment_id);
    }

    /// Best-effort (not atomic with the write itself): advance the
    /// persisted `tail_segment` when a newly written address lands in a
    /// later segment than previously recorded.
    fn sync_tail_segment(&self, highest_address: u64) -> Result<()> {
        self.advance_global_tail(highest_address);
        let segment_id = self.config.segment_of(highest_address);
        loop {
            let current = self.last_segment.load(Ordering::SeqCst);
            if segment_id <= current {
                return Ok(());
            }
            if self
                .last_segment
                .compare_exchange(current, segment_id, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return self.server_context.set_tail_segment(segment_id);
            }
        }
    }

    /// Append one record at the caller-assigned `address`.
    pub fn append(&self, address: u64, record: Record) -> Result<AddressMetaData> {
        let starting_address = self.server_context.starting_address()?;
        let meta = append::append_single(&self.append_ctx(), record.into_request(address), starting_address)?;
        self.mark_dirty(self.config.segment_of(address));
        self.sync_tail_segment(address)?;
        Ok(meta)
    }

    /// Append a contiguous run of caller-addressed records as a single
    /// batch. Preprocessing happens here, ahead of the segment-level write:
    /// an entry whose `data_type` marks it a trim marker is converted into
    /// a `prefix_trim` call and dropped from the write set; an entry below
    /// the current trim mark is dropped silently. The result vector has one
    /// entry per surviving (non-dropped) input, in address order.
    pub fn append_batch(&self, records: Vec<(u64, Record)>) -> Result<Vec<AddressMetaData>> {
        let starting_address = self.server_context.starting_address()?;
        let trim_marker = DataType::TrimMark as i32;

        let mut processed = Vec::with_capacity(records.len());
        for (address, record) in records {
            let request = record.into_request(address);
            if request.data_type == trim_marker {
                self.prefix_trim(address)?;
                continue;
            }
            if address < starting_address {
                continue;
            }
            processed.push(request);
        }

        if processed.is_empty() {
            return Ok(Vec::new());
        }

        let segment_ids: HashSet<u64> = processed.iter().map(|r| self.config.segment_of(r.address)).collect();
        let last_address = processed.last().map(|r| r.address);

        let metas = append::append_batch(&self.append_ctx(), processed)?;
        for segment_id in segment_ids {
            self.mark_dirty(segment_id);
        }
        if let Some(address) = last_address {
            self.sync_tail_segment(address)?;
        }
        Ok(metas)
    }

    /// Read the record at `address`, or `None` if it was never written, has
    /// been trimmed, or falls below the current trim mark.
    pub fn read(&self, address: u64) -> Result<Option<LogEntry>> {
        if address < self.server_context.starting_address()? {
            return Ok(None);
        }
        let segment_id = self.config.segment_of(address);
        let lock = self.locks.get(segment_id);
        let _guard = lock.read().unwrap();
        let segment = self.cache.get(segment_id)?;
        let result = if segment.is_pending_trim(address) {
            Ok(None)
        } else {
            segment.read_record(address)
        };
        self.cache.release(&segment)?;
        result
    }

    pub fn trim(&self, address: u64) -> Result<()> {
        trim::trim(&self.trim_ctx(), address)
    }

    /// Trim every address up to and including `address`: `trim_mark()`
    /// becomes `address + 1`.
    pub fn prefix_trim(&self, address: u64) -> Result<()> {
        trim::prefix_trim(self.server_context.as_ref(), address)
    }

    pub fn compact(&self) -> Result<CompactionReport> {
        trim::compact(&self.trim_ctx(), self.server_context.as_ref(), self.last_segment.load(Ordering::SeqCst))
    }

    /// `force=true` drains the dirty-channel set and fsyncs each segment's
    /// log file before returning — every append that completed before this
    /// call is then durable. `force=false` just clears the set without
    /// forcing anything to disk; that path gives no durability guarantee.
    pub fn sync(&self, force: bool) -> Result<()> {
        let dirty: Vec<u64> = {
            let mut guard = self.dirty_segments.lock().unwrap();
            guard.drain().collect()
        };
        if !force {
            return Ok(());
        }
        for segment_id in dirty {
            let segment = self.cache.get(segment_id)?;
            let result = segment.sync_log();
            self.cache.release(&segment)?;
            result?;
        }
        Ok(())
    }

    /// Highest address ever successfully appended, or `-1` if the log is
    /// empty.
    pub fn global_tail(&self) -> i64 {
        self.global_tail.load(Ordering::SeqCst)
    }

    pub fn trim_mark(&self) -> Result<u64> {
        self.server_context.starting_address()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            global_tail: self.global_tail(),
            trim_mark: self.trim_mark()?,
            tail_segment: self.last_segment.load(Ordering::SeqCst),
            resident_segments: self.cache.resident_count(),
            dirty_segments: self.dirty_segments.lock().unwrap().len(),
        })
    }

    /// No-op: segments close themselves when the cache evicts or drops
    /// them. Kept so the facade matches the lifecycle callers expect
    /// (`open` paired with `close`) even though nothing needs releasing
    /// eagerly here.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Recover `(global_tail, tail_segment)` on startup by scanning the segment
/// the server context remembers as the tail, plus the segment right after
/// it in case a crash advanced the log without persisting that fact.
fn recover_tail(dir: &Path, config: &EngineConfig, server_context: &dyn ServerContext) -> Result<(i64, u64)> {
    let stored_tail_segment = server_context.tail_segment()?;

    let mut best_segment = stored_tail_segment;
    let mut best_tail: i64 = -1;

    let current = Segment::open(dir, stored_tail_segment, config)?;
    if let Some(max_addr) = current.known_addresses_snapshot().keys().copied().max() {
        best_tail = best_tail.max(max_addr as i64);
    }
    current.close()?;

    let lookahead = stored_tail_segment + 1;
    if paths::log_path(dir, lookahead).exists() {
        let ahead = Segment::open(dir, lookahead, config)?;
        if let Some(max_addr) = ahead.known_addresses_snapshot().keys().copied().max() {
            if max_addr as i64 > best_tail {
                best_tail = max_addr as i64;
                best_segment = lookahead;
                log::debug!(
                    "tail_segment {stored_tail_segment} was stale on open; segment {lookahead} had newer data"
                );
            }
        }
        ahead.close()?;
    }

    Ok((best_tail, best_segment))
}
