//! Append path: single-record and batched writes, and the rank policy
//! that lets a caller propose a conditional overwrite at an address that
//! already has a value.
//!
//! A plain (unranked) write to an address is immutable once made — a second
//! write without a rank is always `Overwrite`. An address written *with* a
//! rank stays open to further proposals: a strictly higher `(value, uuid)`
//! wins and is physically appended as a new frame (the old bytes become
//! reclaimable garbage for the next compaction), an identical rank with
//! identical bytes is a no-op, and anything else is rejected. Once an
//! address has been physically reclaimed by a compaction (it shows up in
//! `trimmed_addresses`, no longer in `known_addresses`), it is decided
//! forever: nothing, ranked or not, may land there again.
//!
//! Batch append has different idempotence rules than single append: a
//! record whose address is already known is silently skipped rather than
//! rejected — a caller retrying a partially-applied batch should not have
//! to special-case the records that already landed.

use std::collections::HashMap;

use crate::cache::SegmentCache;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lock::LockTable;
use crate::proto::{LogEntry, Rank};
use crate::segment::{AddressMetaData, Segment};

pub struct AppendContext<'a> {
    pub cache: &'a SegmentCache,
    pub locks: &'a LockTable,
    pub config: &'a EngineConfig,
}

#[derive(Clone)]
pub struct AppendRequest {
    pub address: u64,
    pub data_type: i32,
    pub data: Vec<u8>,
    pub streams: Vec<String>,
    pub backpointers: HashMap<String, u64>,
    pub rank: Option<Rank>,
}

impl AppendRequest {
    fn into_entry(self) -> LogEntry {
        LogEntry {
            global_address: self.address,
            data_type: self.data_type,
            data: self.data,
            streams: self.streams,
            backpointers: self.backpointers,
            rank: self.rank,
            checkpoint_entry_type: None,
            checkpoint_id: None,
            checkpointed_stream_id: None,
            checkpointed_stream_start: None,
        }
    }
}

/// Outcome of evaluating the rank policy against whatever is already
/// written (if anything) at an address.
enum Decision {
    Write,
    /// Identical rank, identical payload: nothing new needs to land.
    NoOp(AddressMetaData),
}

/// Decide what to do with `request`, against whatever `segment` currently
/// holds at its address. Caller must already hold the segment's write lock
/// so this check and the append it leads to happen atomically.
fn evaluate_rank_policy(segment: &Segment, request: &AppendRequest) -> Result<Decision> {
    let existing_meta = segment.known_address(request.address);
    let Some(_meta) = existing_meta else {
        // Already physically reclaimed by a prior compaction: its rank,
        // if any, is gone with the data, so there is nothing left to
        // out-rank. Treat as permanently decided either way.
        if segment.is_trimmed(request.address) {
            return Err(Error::Overwrite { address: request.address });
        }
        return Ok(Decision::Write);
    };
    let existing = segment
        .read_record(request.address)?
        .expect("known_address implies the record is readable");

    let existing_rank = match existing.rank {
        Some(rank) => rank,
        // No rank on the stored record: a ranked request may still adopt
        // the address, but an unranked one is the usual immutable-write
        // conflict.
        None => {
            return match request.rank {
                Some(_) => Ok(Decision::Write),
                None => Err(Error::Overwrite { address: request.address }),
            };
        }
    };
    let Some(new_rank) = request.rank.clone() else {
        return Err(Error::Overwrite { address: request.address });
    };

    let existing_key = (existing_rank.value, existing_rank.uuid.clone());
    let new_key = (new_rank.value, new_rank.uuid.clone());

    if new_key == existing_key {
        if existing.data == request.data {
            Ok(Decision::NoOp(existing_meta.expect("checked above")))
        } else {
            Err(Error::ValueAdopted {
                address: request.address,
                value: existing_rank.value,
                uuid: existing_rank.uuid,
            })
        }
    } else if new_key > existing_key {
        Ok(Decision::Write)
    } else {
        Err(Error::DataOutranked {
            address: request.address,
            value: existing_rank.value,
            uuid: existing_rank.uuid,
        })
    }
}

/// Append one record, applying the rank policy if the address is already
/// occupied. `starting_address` is the caller's current trim mark: an
/// address below it can never be written, ranked or not.
pub fn append_single(ctx: &AppendContext, request: AppendRequest, starting_address: u64) -> Result<AddressMetaData> {
    if request.address < starting_address {
        return Err(Error::Overwrite { address: request.address });
    }
    let segment_id = ctx.config.segment_of(request.address);
    let lock = ctx.locks.get(segment_id);
    let _guard = lock.write().unwrap();
    let segment = ctx.cache.get(segment_id)?;

    let decision = evaluate_rank_policy(&segment, &request);
    let result = match decision {
        Ok(Decision::NoOp(meta)) => Ok(meta),
        Ok(Decision::Write) => {
            let entry = request.into_entry();
            segment.append_record(entry.global_address, &entry)
        }
        Err(err) => Err(err),
    };
    ctx.cache.release(&segment)?;
    result
}

/// Append a contiguous run of records in as few physical writes as
/// possible. The batch may span at most two segments (a run that crosses
/// exactly one segment boundary); anything wider is a caller error. Records
/// whose address already exists are silently skipped rather than rejected
/// — the returned vector has one entry per input request, in order,
/// whether freshly written or already present.
pub fn append_batch(ctx: &AppendContext, requests: Vec<AppendRequest>) -> Result<Vec<AddressMetaData>> {
    if requests.is_empty() {
        return Err(Error::IllegalArgument("append_batch called with no records"));
    }
    for pair in requests.windows(2) {
        if pair[1].address != pair[0].address + 1 {
            return Err(Error::IllegalArgument("append_batch requires contiguous addresses"));
        }
    }

    let segment_ids: Vec<u64> = {
        let mut ids: Vec<u64> = requests.iter().map(|r| ctx.config.segment_of(r.address)).collect();
        ids.dedup();
        ids
    };
    if segment_ids.len() > 2 {
        return Err(Error::IllegalArgument("append_batch spans more than two segments"));
    }

    let mut results: Vec<Option<AddressMetaData>> = vec![None; requests.len()];
    for &segment_id in &segment_ids {
        let lock = ctx.locks.get(segment_id);
        let _guard = lock.write().unwrap();
        let segment = ctx.cache.get(segment_id)?;

        let mut owned_entries = Vec::new();
        let mut indices = Vec::new();
        for (i, request) in requests.iter().enumerate() {
            if ctx.config.segment_of(request.address) != segment_id {
                continue;
            }
            if let Some(meta) = segment.known_address(request.address) {
                // Batch append is idempotent against addresses it already
                // knows about: no rank check, just skip.
                results[i] = Some(meta);
                continue;
            }
            owned_entries.push((request.address, request.clone().into_entry()));
            indices.push(i);
        }

        if !indices.is_empty() {
            let batch: Vec<(u64, &LogEntry)> = owned_entries.iter().map(|(a, e)| (*a, e)).collect();
            let written = segment.append_batch(&batch)?;
            for (&i, (_, meta)) in indices.iter().zip(written.iter()) {
                results[i] = Some(*meta);
            }
        }

        ctx.cache.release(&segment)?;
    }

    Ok(results.into_iter().map(|m| m.expect("every index assigned")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn ctx<'a>(cache: &'a SegmentCache, locks: &'a LockTable, config: &'a EngineConfig) -> AppendContext<'a> {
        AppendContext { cache, locks, config }
    }

    fn plain(address: u64, data: &[u8]) -> AppendRequest {
        AppendRequest {
            address,
            data_type: 0,
            data: data.to_vec(),
            streams: vec![],
            backpointers: HashMap::new(),
            rank: None,
        }
    }

    fn ranked(address: u64, data: &[u8], value: u64, uuid: &str) -> AppendRequest {
        AppendRequest {
            rank: Some(Rank {
                value,
                uuid: uuid.to_string(),
            }),
            ..plain(address, data)
        }
    }

    fn new_env(dir: &Path) -> (SegmentCache, LockTable, EngineConfig) {
        let config = EngineConfig::default();
        (SegmentCache::new(dir.to_path_buf(), config), LockTable::new(), config)
    }

    #[test]
    fn plain_second_write_is_rejected() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, plain(0, b"a"), 0).unwrap();
        let err = append_single(&c, plain(0, b"b"), 0).unwrap_err();
        assert!(matches!(err, Error::Overwrite { address: 0 }));
    }

    #[test]
    fn address_below_starting_address_is_rejected() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        let err = append_single(&c, plain(3, b"a"), 5).unwrap_err();
        assert!(matches!(err, Error::Overwrite { address: 3 }));
    }

    #[test]
    fn higher_rank_overwrites() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, ranked(0, b"a", 1, "u1"), 0).unwrap();
        append_single(&c, ranked(0, b"b", 2, "u2"), 0).unwrap();

        let segment = cache.get(0).unwrap();
        let got = segment.read_record(0).unwrap().unwrap();
        assert_eq!(got.data, b"b");
        cache.release(&segment).unwrap();
    }

    #[test]
    fn lower_rank_is_outranked() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, ranked(0, b"a", 5, "u1"), 0).unwrap();
        let err = append_single(&c, ranked(0, b"b", 1, "u0"), 0).unwrap_err();
        assert!(matches!(err, Error::DataOutranked { .. }));
    }

    #[test]
    fn equal_rank_same_payload_is_idempotent() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        let first = append_single(&c, ranked(0, b"a", 5, "u1"), 0).unwrap();
        let second = append_single(&c, ranked(0, b"a", 5, "u1"), 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn equal_rank_different_payload_is_value_adopted() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, ranked(0, b"a", 5, "u1"), 0).unwrap();
        let err = append_single(&c, ranked(0, b"b", 5, "u1"), 0).unwrap_err();
        assert!(matches!(err, Error::ValueAdopted { .. }));
    }

    #[test]
    fn trimmed_address_can_never_be_rewritten() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, ranked(0, b"a", 5, "u1"), 0).unwrap();
        let segment = cache.get(0).unwrap();
        segment.write_trimmed(0).unwrap();
        cache.release(&segment).unwrap();

        let err = append_single(&c, ranked(0, b"z", 99, "u9"), 0).unwrap_err();
        assert!(matches!(err, Error::Overwrite { address: 0 }));
    }

    /// Real clients mint a fresh UUID per writer instance rather than the
    /// short literal tags used elsewhere in this module; rank comparison
    /// only cares about equality of the tuple, not the string's format.
    #[test]
    fn rank_uuid_is_opaque_to_the_engine() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        let writer = uuid::Uuid::new_v4().to_string();

        append_single(&c, ranked(0, b"a", 1, &writer), 0).unwrap();
        let resubmitted = append_single(&c, ranked(0, b"a", 1, &writer), 0).unwrap();
        let second = append_single(&c, ranked(0, b"b", 2, &writer), 0).unwrap();

        let segment = cache.get(0).unwrap();
        assert_eq!(segment.read_record(0).unwrap().unwrap().data, b"b");
        cache.release(&segment).unwrap();
        assert_eq!(resubmitted.length, 1);
        assert_eq!(second.length, 1);
    }

    #[test]
    fn ranked_request_adopts_an_unranked_existing_record() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, plain(0, b"a"), 0).unwrap();
        append_single(&c, ranked(0, b"b", 1, "u1"), 0).unwrap();

        let segment = cache.get(0).unwrap();
        assert_eq!(segment.read_record(0).unwrap().unwrap().data, b"b");
        cache.release(&segment).unwrap();
    }

    #[test]
    fn unranked_request_against_unranked_existing_is_overwrite() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_single(&c, plain(0, b"a"), 0).unwrap();
        let err = append_single(&c, plain(0, b"b"), 0).unwrap_err();
        assert!(matches!(err, Error::Overwrite { address: 0 }));
    }

    #[test]
    fn concurrent_unranked_appends_exactly_one_succeeds() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Barrier;

        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);

        let successes = AtomicUsize::new(0);
        let overwrites = AtomicUsize::new(0);
        let barrier = Barrier::new(4);

        std::thread::scope(|scope| {
            for i in 0..4u8 {
                let c = &c;
                let successes = &successes;
                let overwrites = &overwrites;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    match append_single(c, plain(0, &[i]), 0) {
                        Ok(_) => {
                            successes.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(Error::Overwrite { address: 0 }) => {
                            overwrites.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(other) => panic!("unexpected error: {other:?}"),
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(overwrites.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn batch_rejects_non_contiguous_addresses() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        let err = append_batch(&c, vec![plain(0, b"a"), plain(2, b"b")]).unwrap_err();
        assert!(matches!(err, Error::IllegalArgument(_)));
    }

    #[test]
    fn batch_writes_land_in_order() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        let metas = append_batch(&c, vec![plain(0, b"a"), plain(1, b"b"), plain(2, b"c")]).unwrap();
        assert_eq!(metas.len(), 3);

        let segment = cache.get(0).unwrap();
        assert_eq!(segment.read_record(1).unwrap().unwrap().data, b"b");
        cache.release(&segment).unwrap();
    }

    #[test]
    fn batch_is_idempotent_against_already_known_addresses() {
        let dir = tempdir().unwrap();
        let (cache, locks, config) = new_env(dir.path());
        let c = ctx(&cache, &locks, &config);
        append_batch(&c, vec![plain(0, b"a"), plain(1, b"b")]).unwrap();

        // Re-submitting the same batch (as a caller retrying after a partial
        // failure might) must succeed and change nothing.
        let metas = append_batch(&c, vec![plain(0, b"a"), plain(1, b"b"), plain(2, b"c")]).unwrap();
        assert_eq!(metas.len(), 3);

        let segment = cache.get(0).unwrap();
        assert_eq!(segment.read_record(0).unwrap().unwrap().data, b"a");
        assert_eq!(segment.read_record(2).unwrap().unwrap().data, b"c");
        cache.release(&segment).unwrap();
    }
}
