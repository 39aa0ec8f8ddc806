//! Trim and compaction path.
//!
//! Trimming is purely logical until a compaction pass reclaims the space:
//!
//! - [`trim`] tombstones one address (appends to its segment's `.pending`
//!   sidecar).
//! - [`prefix_trim`] advances the engine-wide trim mark past which no
//!   address may ever be read again.
//! - [`compact`] does the physical reclaiming in two independent sweeps:
//!   prefix compaction deletes whole segment files that fall entirely
//!   below the trim mark, and sparse compaction rewrites one full segment
//!   that has accumulated enough pending trims to be worth the rewrite.
//!
//! Sparse compaction only ever rewrites **one** segment per `compact()`
//! call — the first eligible one it finds, then returns — rather than
//! sweeping every eligible segment in a single pass. This bounds the I/O
//! done (and the time a segment spends locked for writing) per call; a
//! caller that wants every eligible segment compacted calls `compact`
//! again until it reports nothing left to do.

use std::fs;

use crate::cache::SegmentCache;
use crate::codec;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::lock::LockTable;
use crate::segment::paths;
use crate::server_context::ServerContext;

pub struct TrimContext<'a> {
    pub cache: &'a SegmentCache,
    pub locks: &'a LockTable,
    pub config: &'a EngineConfig,
    pub dir: &'a std::path::Path,
}

/// Tombstone `address`: it will never be returned by a read again, though
/// its bytes may linger on disk until the next compaction reclaims them.
/// A no-op (not an error) if `address` was never written or is already
/// pending trim — `trim` must be idempotent.
pub fn trim(ctx: &TrimContext, address: u64) -> Result<()> {
    let segment_id = ctx.config.segment_of(address);
    let lock = ctx.locks.get(segment_id);
    let _guard = lock.write().unwrap();
    let segment = ctx.cache.get(segment_id)?;
    let result = if !segment.contains(address) || segment.is_pending_trim(address) {
        Ok(())
    } else {
        segment.write_pending_trim(address)
    };
    ctx.cache.release(&segment)?;
    result
}

/// Advance the engine-wide trim mark so that `address` (and everything
/// below it) is logically deleted: `starting_address` becomes `address + 1`,
/// the exclusive lower bound of what may still be read or written. A call
/// whose `address` is already below the current mark is an idempotent
/// no-op. Durable immediately: the caller's next read of `starting_address`
/// (even after a restart) reflects this call.
pub fn prefix_trim(server_context: &dyn ServerContext, address: u64) -> Result<()> {
    let current = server_context.starting_address()?;
    if address < current {
        log::warn!("prefix_trim({address}) is below the current trim mark {current}; ignoring");
        return Ok(());
    }
    let target = address + 1;
    if target > current {
        server_context.set_starting_address(target)?;
    }
    Ok(())
}

/// Outcome of one `compact()` call, reported so callers (and tests) can
/// tell prefix deletion and sparse rewriting apart.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub segments_deleted: Vec<u64>,
    pub segment_rewritten: Option<u64>,
}

/// `starting_address == 0` means nothing has ever been trimmed, so there is
/// nothing for a prefix compact to do: sparse compact always runs instead
/// in that case.
pub fn compact(ctx: &TrimContext, server_context: &dyn ServerContext, tail_segment: u64) -> Result<CompactionReport> {
    let mut report = CompactionReport::default();
    let starting_address = server_context.starting_address()?;

    if starting_address == 0 {
        report.segment_rewritten = sparse_compact(ctx, 0, tail_segment)?;
        return Ok(report);
    }

    report.segments_deleted = prefix_delete(ctx, starting_address, tail_segment)?;
    Ok(report)
}

/// Rewrite at most one eligible full segment in `[from, tail_segment)`,
/// stopping for good (not just skipping to the next segment) the moment the
/// first full-but-below-threshold segment is found — a deliberately
/// preserved quirk: later segments in the same range are left unexamined
/// until the next call.
fn sparse_compact(ctx: &TrimContext, from: u64, tail_segment: u64) -> Result<Option<u64>> {
    for segment_id in from..tail_segment {
        if !paths::log_path(ctx.dir, segment_id).exists() {
            continue;
        }
        match try_sparse_compact(ctx, segment_id)? {
            SparseOutcome::NotFull => continue,
            SparseOutcome::BelowThreshold => {
                log::debug!(
                    "sparse compact: segment {segment_id} is full but below the trim threshold; stopping this pass"
                );
                return Ok(None);
            }
            SparseOutcome::Rewrote => return Ok(Some(segment_id)),
        }
    }
    Ok(None)
}

/// Delete every segment whose entire address range falls below `starting_address`.
/// Never touches `tail_segment`, the one still being appended to.
fn prefix_delete(ctx: &TrimContext, starting_address: u64, tail_segment: u64) -> Result<Vec<u64>> {
    let mut deleted = Vec::new();
    let mut freed_bytes = 0u64;
    let mut segment_id = 0u64;
    loop {
        if segment_id >= tail_segment {
            break;
        }
        let segment_end = (segment_id + 1) * ctx.config.records_per_segment;
        if segment_end > starting_address {
            break;
        }
        let log_path = paths::log_path(ctx.dir, segment_id);
        if !log_path.exists() {
            segment_id += 1;
            continue;
        }

        let lock = ctx.locks.get(segment_id);
        let _guard = lock.write().unwrap();
        freed_bytes += log_path.metadata().map(|m| m.len()).unwrap_or(0);
        ctx.cache.evict(segment_id)?;
        remove_segment_files(ctx.dir, segment_id)?;
        deleted.push(segment_id);
        segment_id += 1;
    }
    if !deleted.is_empty() {
        log::info!("prefix compact: deleted segments {deleted:?}, freeing {freed_bytes} bytes");
    }
    Ok(deleted)
}

fn remove_segment_files(dir: &std::path::Path, segment_id: u64) -> Result<()> {
    for path in [
        paths::log_path(dir, segment_id),
        paths::trimmed_path(dir, segment_id),
        paths::pending_path(dir, segment_id),
    ] {
        if path.exists() {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// Whether a candidate segment was rewritten, skipped for not being full
/// yet, or full but not holding enough pending trims to be worth rewriting.
enum SparseOutcome {
    NotFull,
    BelowThreshold,
    Rewrote,
}

/// Rewrite `segment_id` if it is full (every address in its range is either
/// known or already trimmed) and has accumulated at least `trim_threshold`
/// pending trims, dropping those addresses for good.
fn try_sparse_compact(ctx: &TrimContext, segment_id: u64) -> Result<SparseOutcome> {
    let lock = ctx.locks.get(segment_id);
    let _guard = lock.write().unwrap();
    let segment = ctx.cache.get(segment_id)?;

    let is_full = segment.known_address_count() as u64 + segment.trimmed_count() as u64 == ctx.config.records_per_segment;
    if !is_full {
        ctx.cache.release(&segment)?;
        return Ok(SparseOutcome::NotFull);
    }

    let to_drop = segment.pending_trims_minus_trimmed();
    if (to_drop.len() as u64) < ctx.config.trim_threshold {
        ctx.cache.release(&segment)?;
        return Ok(SparseOutcome::BelowThreshold);
    }

    let mut addresses: Vec<u64> = segment.known_addresses_snapshot().into_iter().map(|(a, _)| a).collect();
    addresses.sort_unstable();

    let copy_path = paths::copy_path(ctx.dir, segment_id);
    let copy_file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&copy_path)?;

    let header_bytes = codec::encode_header(ctx.config.log_format_version, !ctx.config.no_verify);
    std::os::unix::fs::FileExt::write_all_at(&copy_file, &header_bytes, 0)?;
    let mut offset = header_bytes.len() as u64;

    for address in &addresses {
        if to_drop.contains(address) {
            continue;
        }
        let Some(entry) = segment.read_record(*address)? else {
            continue;
        };
        let framed = codec::encode_record(&entry);
        std::os::unix::fs::FileExt::write_all_at(&copy_file, &framed, offset)?;
        offset += framed.len() as u64;
    }
    copy_file.sync_all()?;

    // Verify the rewritten file end-to-end before it ever becomes the live
    // `<seg>.log`. A stale `.copy` left behind by a failed verification is
    // harmless: the next compact attempt truncates it.
    let rescan = crate::scan::scan_log_file(&copy_file, segment_id, ctx.config.no_verify)?;
    if rescan.end_offset != offset {
        return Err(crate::error::Error::DataCorruption {
            segment: segment_id,
            reason: "rewritten segment failed its post-compact re-scan",
        });
    }

    // Sidecar durably records the trims *before* the rewritten file replaces
    // the original, so a crash between the two never loses track of which
    // addresses were meant to disappear.
    for address in &to_drop {
        segment.write_trimmed(*address)?;
    }
    segment.sync_trimmed()?;

    fs::rename(&copy_path, paths::log_path(ctx.dir, segment_id))?;

    ctx.cache.evict(segment_id)?;
    ctx.cache.release(&segment)?;

    log::debug!("sparse compact: rewrote segment {segment_id}, dropping {} addresses", to_drop.len());

    Ok(SparseOutcome::Rewrote)
}
