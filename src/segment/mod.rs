//! Segment file: owns the three files that make up one segment, its
//! in-memory indices, and its ref-count. One [`Segment`] is the unit of
//! locking (see [`crate::lock`]) and caching (see [`crate::cache`]).

pub mod paths;

pub use paths::{log_path, parse_segment_id, pending_path, segment_filename, trimmed_path};

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;
use memmap2::Mmap;

use crate::codec;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::proto::LogEntry;
use crate::scan;

/// Where a record's payload lives on disk, plus enough of its envelope to
/// re-verify it without re-reading the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMetaData {
    pub checksum: i32,
    pub length: i32,
    /// Absolute byte offset of the payload (past delimiter + metadata block).
    pub offset: u64,
}

/// Outcome of writing one record into a segment's `known_addresses`.
struct Indices {
    known_addresses: HashMap<u64, AddressMetaData>,
    trimmed_addresses: HashSet<u64>,
    pending_trims: HashSet<u64>,
}

/// One open segment: the three backing files, their write cursors, and the
/// indices rebuilt on open. `ref_count` follows an arena-style contract:
/// every handle obtained from the cache must be released exactly once.
pub struct Segment {
    pub segment_id: u64,
    no_verify: bool,

    log_file: File,
    trimmed_file: File,
    pending_file: File,

    log_offset: AtomicU64,
    trimmed_offset: AtomicU64,
    pending_offset: AtomicU64,

    indices: Mutex<Indices>,

    ref_count: AtomicU64,
    /// Set once the cache has evicted this segment while readers were still
    /// attached. The last `release()` to observe `ref_count == 0` on a
    /// condemned segment performs the deferred close.
    condemned: std::sync::atomic::AtomicBool,
}

impl Segment {
    /// Open (or create) the segment numbered `segment_id` under `dir`,
    /// writing a fresh file header if the log file is empty, and scanning
    /// the log plus both sidecars to rebuild all in-memory indices.
    pub fn open(dir: &Path, segment_id: u64, config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path(dir, segment_id))?;
        let trimmed_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(trimmed_path(dir, segment_id))?;
        let pending_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(pending_path(dir, segment_id))?;

        let log_len = log_file.metadata()?.len();
        let header_written = if log_len == 0 {
            let header_bytes = codec::encode_header(config.log_format_version, !config.no_verify);
            log_file.write_all_at(&header_bytes, 0)?;
            log_file.sync_all()?;
            header_bytes.len() as u64
        } else {
            0
        };

        let scan::ScanOutcome {
            known_addresses,
            end_offset,
        } = scan::scan_log_file(&log_file, segment_id, config.no_verify)?;
        let log_offset = end_offset.max(header_written);

        let trimmed_bytes = read_all(&trimmed_file)?;
        let trimmed_addresses: HashSet<u64> = codec::decode_trim_entries(&trimmed_bytes)?.into_iter().collect();
        let pending_bytes = read_all(&pending_file)?;
        let pending_trims: HashSet<u64> = codec::decode_trim_entries(&pending_bytes)?.into_iter().collect();

        Ok(Self {
            segment_id,
            no_verify: config.no_verify,
            log_file,
            trimmed_file,
            pending_file,
            log_offset: AtomicU64::new(log_offset),
            trimmed_offset: AtomicU64::new(trimmed_bytes.len() as u64),
            pending_offset: AtomicU64::new(pending_bytes.len() as u64),
            indices: Mutex::new(Indices {
                known_addresses,
                trimmed_addresses,
                pending_trims,
            }),
            ref_count: AtomicU64::new(0),
            condemned: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn known_address(&self, address: u64) -> Option<AddressMetaData> {
        self.indices.lock().unwrap().known_addresses.get(&address).copied()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.indices.lock().unwrap().known_addresses.contains_key(&address)
    }

    pub fn is_trimmed(&self, address: u64) -> bool {
        self.indices.lock().unwrap().trimmed_addresses.contains(&address)
    }

    pub fn is_pending_trim(&self, address: u64) -> bool {
        self.indices.lock().unwrap().pending_trims.contains(&address)
    }

    pub fn known_address_count(&self) -> usize {
        self.indices.lock().unwrap().known_addresses.len()
    }

    pub fn trimmed_count(&self) -> usize {
        self.indices.lock().unwrap().trimmed_addresses.len()
    }

    /// Snapshot of every address this segment currently has data for, used
    /// by sparse compaction to decide what to carry into the rewritten
    /// file.
    pub fn known_addresses_snapshot(&self) -> HashMap<u64, AddressMetaData> {
        self.indices.lock().unwrap().known_addresses.clone()
    }

    pub fn pending_trims_minus_trimmed(&self) -> HashSet<u64> {
        let indices = self.indices.lock().unwrap();
        indices
            .pending_trims
            .difference(&indices.trimmed_addresses)
            .copied()
            .collect()
    }

    /// Append one record at `address`. Caller holds this segment's write
    /// lock. Inserts into `known_addresses` on success.
    pub fn append_record(&self, address: u64, entry: &LogEntry) -> Result<AddressMetaData> {
        let framed = codec::encode_record(entry);
        let delim_and_meta = 2 + codec::metadata_size();
        let payload_len = framed.len() - delim_and_meta;

        let offset = self.log_offset.fetch_add(framed.len() as u64, Ordering::SeqCst);
        self.log_file.write_all_at(&framed, offset)?;

        let meta = AddressMetaData {
            checksum: crc_of(&framed, delim_and_meta),
            length: payload_len as i32,
            offset: offset + delim_and_meta as u64,
        };
        self.indices.lock().unwrap().known_addresses.insert(address, meta);
        Ok(meta)
    }

    /// Append a contiguous run of records as a single buffered write (used
    /// by the batched append path).
    pub fn append_batch(&self, entries: &[(u64, &LogEntry)]) -> Result<Vec<(u64, AddressMetaData)>> {
        let mut buf = BytesMut::new();
        let mut offsets = Vec::with_capacity(entries.len());
        let base_offset = self.log_offset.load(Ordering::SeqCst);
        let delim_and_meta = 2 + codec::metadata_size();

        for (address, entry) in entries {
            let framed = codec::encode_record(entry);
            let payload_len = framed.len() - delim_and_meta;
            let record_offset = base_offset + buf.len() as u64;
            let meta = AddressMetaData {
                checksum: crc_of(&framed, delim_and_meta),
                length: payload_len as i32,
                offset: record_offset + delim_and_meta as u64,
            };
            offsets.push((*address, meta));
            buf.extend_from_slice(&framed);
        }

        self.log_file.write_all_at(&buf, base_offset)?;
        self.log_offset.fetch_add(buf.len() as u64, Ordering::SeqCst);

        let mut indices = self.indices.lock().unwrap();
        for (address, meta) in &offsets {
            indices.known_addresses.insert(*address, *meta);
        }
        drop(indices);

        Ok(offsets)
    }

    /// Read the record at `address`, if this segment has it. Memory-maps
    /// the log file for just this call and reads the payload window out of
    /// it rather than through a positioned read syscall; the mapping is not
    /// kept around past the call, since appends extend the file underneath
    /// any long-lived mapping.
    pub fn read_record(&self, address: u64) -> Result<Option<LogEntry>> {
        let meta = match self.known_address(address) {
            Some(meta) => meta,
            None => return Ok(None),
        };

        // SAFETY: dropped before this function returns; no other thread
        // truncates this file concurrently (appends only ever extend it).
        let map = unsafe { Mmap::map(&self.log_file)? };
        let start = meta.offset as usize;
        let end = start + meta.length as usize;
        if end > map.len() {
            return Err(Error::DataCorruption {
                segment: self.segment_id,
                reason: "known address points past the end of the log file",
            });
        }

        let metadata = crate::proto::Metadata {
            checksum: meta.checksum,
            length: meta.length,
        };
        let entry = codec::decode_entry(&map[start..end], &metadata, self.segment_id, self.no_verify)?;
        Ok(Some(entry))
    }

    /// Append a tombstone for `address` to the `.pending` sidecar.
    pub fn write_pending_trim(&self, address: u64) -> Result<()> {
        let bytes = codec::encode_trim_entry(address);
        let offset = self.pending_offset.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.pending_file.write_all_at(&bytes, offset)?;
        self.indices.lock().unwrap().pending_trims.insert(address);
        Ok(())
    }

    /// Append a confirmed trim for `address` to the `.trimmed` sidecar, used
    /// while sparse-compacting. Fsyncs so the sidecar is durable before the
    /// rewritten log file replaces the original.
    pub fn write_trimmed(&self, address: u64) -> Result<()> {
        let bytes = codec::encode_trim_entry(address);
        let offset = self.trimmed_offset.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.trimmed_file.write_all_at(&bytes, offset)?;
        self.indices.lock().unwrap().trimmed_addresses.insert(address);
        Ok(())
    }

    pub fn sync_trimmed(&self) -> Result<()> {
        self.trimmed_file.sync_all()?;
        Ok(())
    }

    pub fn sync_log(&self) -> Result<()> {
        self.log_file.sync_all()?;
        Ok(())
    }

    pub fn log_len(&self) -> u64 {
        self.log_offset.load(Ordering::SeqCst)
    }

    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a handle obtained via `retain()`. Errors if the count is
    /// already zero — a double release is a caller bug.
    pub fn release(&self) -> Result<bool> {
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            self.ref_count.store(0, Ordering::SeqCst);
            return Err(Error::IllegalArgument("released a segment with ref_count already zero"));
        }
        Ok(prev == 1)
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn condemn(&self) {
        self.condemned.store(true, Ordering::SeqCst);
    }

    pub fn is_condemned(&self) -> bool {
        self.condemned.load(Ordering::SeqCst)
    }

    /// Force and drop all three file handles, clearing the in-memory
    /// indices. After this, the `Segment` must not be used again.
    pub fn close(&self) -> Result<()> {
        self.log_file.sync_all()?;
        self.trimmed_file.sync_all()?;
        self.pending_file.sync_all()?;
        let mut indices = self.indices.lock().unwrap();
        indices.known_addresses.clear();
        indices.trimmed_addresses.clear();
        indices.pending_trims.clear();
        Ok(())
    }
}

fn crc_of(framed: &[u8], delim_and_meta: usize) -> i32 {
    codec::crc32c(&framed[delim_and_meta..]) as i32
}

fn read_all(file: &File) -> Result<Vec<u8>> {
    let len = file.metadata()?.len() as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        file.read_exact_at(&mut buf, 0)?;
    }
    Ok(buf)
}

pub fn path_for_dir(log_path: &Path) -> PathBuf {
    log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
