//! Per-segment lock table: guarantees two callers asking for the same
//! segment id get the same [`RwLock`] instance, so that I/O against
//! different segments runs in parallel while I/O against the same segment
//! is serialized the way a single segment's append/trim/compact operations
//! require.
//!
//! Callers fetch the `Arc<RwLock<()>>` for a segment id and lock it
//! themselves; the table only owns the mapping from id to lock, not the
//! segment data itself (that lives in [`crate::cache::SegmentCache`]).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<u64, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (creating if needed) the lock for `segment_id`.
    pub fn get(&self, segment_id: u64) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(segment_id).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    /// Drop the table's reference to `segment_id`'s lock. Safe to call even
    /// while other callers still hold a clone from an earlier `get` — the
    /// `Arc` keeps it alive for them; the next `get` for this id simply
    /// creates a fresh lock.
    pub fn forget(&self, segment_id: u64) {
        self.locks.lock().unwrap().remove(&segment_id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn same_id_returns_same_lock() {
        let table = LockTable::new();
        let a = table.get(5);
        let b = table.get(5);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_ids_do_not_contend() {
        let table = Arc::new(LockTable::new());
        let a = table.get(1);
        let _guard = a.write().unwrap();

        let table2 = table.clone();
        let handle = thread::spawn(move || {
            let b = table2.get(2);
            let _guard = b.write().unwrap();
        });
        handle.join().unwrap();
    }

    #[test]
    fn forget_lets_a_future_get_start_fresh() {
        let table = LockTable::new();
        let a = table.get(9);
        table.forget(9);
        let b = table.get(9);
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
