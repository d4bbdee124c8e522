//! Thread to arena binding.
//!
//! A thread gets an arena index the first time it asks and keeps it for the life of the table.
//! Indices are handed out in order, `0, 1, 2, ...`, up to the limit. `ThreadId`s are never
//! reused by the runtime, so an exited thread's arena stays parked rather than being inherited.
//!
//! The table's lock is taken once per thread, on first use. After that the thread finds its
//! index in a thread-local cache keyed by table.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::BindError;

static NEXT_TABLE: AtomicU64 = AtomicU64::new(0);

// (table key, arena index) for every table this thread is bound in. Keys are never reused, so
// an entry left behind by a dropped table cannot be matched again.
thread_local!(static BOUND: RefCell<Vec<(u64, u16)>> = const { RefCell::new(Vec::new()) });

fn cached(key: u64) -> Option<u16> {
    BOUND
        .try_with(|b| b.borrow().iter().find(|&&(k, _)| k == key).map(|&(_, index)| index))
        .ok()
        .flatten()
}

fn remember(key: u64, index: u16) {
    // Fails only while this thread's locals are being torn down; the table still has the entry.
    let _ = BOUND.try_with(|b| b.borrow_mut().push((key, index)));
}

#[derive(Debug)]
pub struct BindingTable {
    key: u64,
    map: RwLock<AHashMap<ThreadId, u16>>,
    limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub index: u16,
    /// This call made the binding.
    pub fresh: bool,
}

impl BindingTable {
    pub fn new(limit: usize) -> Self {
        debug_assert!(limit <= u16::MAX as usize);
        let key = NEXT_TABLE.fetch_add(1, Ordering::Relaxed);
        Self { key, map: RwLock::new(AHashMap::with_capacity(limit)), limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// How many threads hold an arena.
    pub fn bound(&self) -> usize {
        self.map.read().len()
    }

    /// The calling thread's arena index, binding the next free one if it has none yet.
    #[inline]
    pub fn bind_current(&self) -> Result<Binding, BindError> {
        if let Some(index) = cached(self.key) {
            return Ok(Binding { index, fresh: false });
        }
        let binding = self.bind(thread::current().id())?;
        remember(self.key, binding.index);
        Ok(binding)
    }

    fn bind(&self, id: ThreadId) -> Result<Binding, BindError> {
        let mut map = self.map.write();
        // Already bound, but asked without the cache.
        if let Some(&index) = map.get(&id) {
            return Ok(Binding { index, fresh: false });
        }
        if map.len() >= self.limit {
            return Err(BindError::ThreadExhaustion { limit: self.limit });
        }
        let index = map.len() as u16;
        map.insert(id, index);
        Ok(Binding { index, fresh: true })
    }

    /// Hold the table's lock exclusively, as a thread binding for the first time would.
    #[cfg(test)]
    pub fn lock_exclusive(&self) -> parking_lot::RwLockWriteGuard<'_, AHashMap<ThreadId, u16>> {
        self.map.write()
    }
}
