//! In-process per-tape write locks.
//!
//! SQLite's IMMEDIATE transactions already serialize writers across
//! processes; this table queues writers to the same tape inside one process
//! so they wait on a mutex instead of spinning on `SQLITE_BUSY`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::TapeId;

#[derive(Debug, Default)]
pub struct TapeLocks {
    locks: Mutex<HashMap<TapeId, Arc<Mutex<()>>>>,
}

impl TapeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<TapeId, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock handle for `tape_id`, created on first use.
    ///
    /// The entry is dropped from the table again when its last handle goes
    /// away, so the table only holds tapes with a writer in flight.
    pub fn handle(&self, tape_id: TapeId) -> TapeLockHandle<'_> {
        let lock = Arc::clone(self.map().entry(tape_id).or_default());
        TapeLockHandle {
            owner: self,
            tape_id,
            lock,
        }
    }

    /// Number of tapes with a live handle
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reference to one tape's mutex; call [`TapeLockHandle::lock`] to hold it.
#[derive(Debug)]
pub struct TapeLockHandle<'a> {
    owner: &'a TapeLocks,
    tape_id: TapeId,
    lock: Arc<Mutex<()>>,
}

impl TapeLockHandle<'_> {
    /// Block until this tape's write lock is held.
    ///
    /// The mutex guards no data, so a poisoned lock is simply taken over.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TapeLockHandle<'_> {
    fn drop(&mut self) {
        // New handles are only minted under the map lock, so a count of two
        // (the table's and ours) cannot grow while we hold it.
        let mut locks = self.owner.map();
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.tape_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_tape_shares_one_mutex() {
        let locks = TapeLocks::new();
        let id = TapeId::new();
        let a = locks.handle(id);
        let b = locks.handle(id);
        assert!(Arc::ptr_eq(&a.lock, &b.lock));
        assert_eq!(locks.len(), 1);

        let _guard = a.lock();
        assert!(b.lock.try_lock().is_err());
    }

    #[test]
    fn idle_entries_are_evicted() {
        let locks = TapeLocks::new();
        let id = TapeId::new();
        {
            let a = locks.handle(id);
            let b = locks.handle(id);
            drop(a.lock());
            drop(a);
            assert_eq!(locks.len(), 1, "b still refers to the entry");
            let _guard = b.lock();
        }
        assert!(locks.is_empty());

        for _ in 0..100 {
            let handle = locks.handle(TapeId::new());
            let _guard = handle.lock();
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn writers_still_serialize_across_eviction() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let locks = Arc::new(TapeLocks::new());
        let id = TapeId::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = locks.handle(id);
                        let _guard = handle.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("writer thread");
        }

        assert_eq!(done.load(Ordering::SeqCst), 200);
        assert!(locks.is_empty());
    }

    #[test]
    fn different_tapes_do_not_contend() {
        let locks = TapeLocks::new();
        let a = locks.handle(TapeId::new());
        let b = locks.handle(TapeId::new());
        let _guard = a.lock();
        assert!(b.lock.try_lock().is_ok());
    }
}
