#![forbid(unsafe_code)]
//! RCU-style primitives for lock-free lookups with deferred reclamation.
//!
//! Backed by [`arc_swap::ArcSwap`]: readers load a snapshot without taking
//! any lock, writers publish a new version atomically, and replaced
//! versions are freed once the last reader reference drops. That refcount
//! drop is the quiescence epoch: a lookup pins the entry against
//! reclamation until the caller lets go of the returned `Arc`.
//!
//! Two shapes are provided:
//!
//! - [`RcuCell`]: a single published value (manifest snapshots and the
//!   like).
//! - [`RcuTable`]: a keyed table of `Arc` entries (the block index and the
//!   peer table). Writers serialize on a side mutex and copy the map;
//!   readers never block.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A single RCU-published value.
pub struct RcuCell<T> {
    inner: ArcSwap<T>,
    update_count: AtomicU64,
}

impl<T: fmt::Debug> fmt::Debug for RcuCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuCell")
            .field("value", &*self.load())
            .field("update_count", &self.update_count())
            .finish()
    }
}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
            update_count: AtomicU64::new(0),
        }
    }

    pub fn from_arc(arc: Arc<T>) -> Self {
        Self {
            inner: ArcSwap::from(arc),
            update_count: AtomicU64::new(0),
        }
    }

    /// Load the current value as a pinned `Arc<T>`.
    ///
    /// The value stays alive for as long as the caller holds the `Arc`,
    /// even across a concurrent `store`.
    #[inline]
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Atomically publish a new value.
    ///
    /// Readers that loaded the old value continue to see it until they
    /// drop their reference; then the old value is freed.
    pub fn store(&self, value: T) {
        self.store_arc(Arc::new(value));
    }

    pub fn store_arc(&self, arc: Arc<T>) {
        self.inner.store(arc);
        self.update_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Swap in a new value, returning the previous one.
    pub fn swap(&self, value: T) -> Arc<T> {
        let old = self.inner.swap(Arc::new(value));
        self.update_count.fetch_add(1, Ordering::Relaxed);
        old
    }

    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}

/// Outcome of [`RcuTable::insert_or_get`].
#[derive(Debug)]
pub struct InsertOutcome<V> {
    /// The entry now present for the key: the caller's on a win, the
    /// previously-present entry on a lost race.
    pub entry: Arc<V>,
    /// Whether the caller's entry was the one inserted.
    pub inserted: bool,
}

/// RCU-protected keyed table.
///
/// Stored as `ArcSwap<HashMap<K, Arc<V>>>`. Readers get a lock-free
/// snapshot; writers clone the map under a side mutex and publish the new
/// version. Entries removed from the table survive until every reader
/// that looked them up has dropped its `Arc` — deletion is deferred to
/// that quiescence point rather than happening in place.
pub struct RcuTable<K, V> {
    inner: ArcSwap<HashMap<K, Arc<V>>>,
    /// Serializes copy-on-write updates. Readers never touch this.
    write_lock: Mutex<()>,
    update_count: AtomicU64,
}

impl<K: fmt::Debug + Clone + Eq + Hash, V> fmt::Debug for RcuTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuTable")
            .field("len", &self.len())
            .field("update_count", &self.update_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, V> Default for RcuTable<K, V>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RcuTable<K, V>
where
    K: Clone + Eq + Hash,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            update_count: AtomicU64::new(0),
        }
    }

    /// Look a key up, returning a pinned entry if present.
    #[inline]
    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.inner.load().get(key).cloned()
    }

    /// Insert `entry` under `key` unless the key is already present.
    ///
    /// On a racing insert the loser's entry is dropped and the winner's is
    /// returned, so all callers converge on one shared entry.
    pub fn insert_or_get(&self, key: K, entry: Arc<V>) -> InsertOutcome<V> {
        let guard = self.write_lock.lock();
        if let Some(existing) = self.inner.load().get(&key) {
            let existing = Arc::clone(existing);
            drop(guard);
            trace!(target: "mfs::rcu", event = "insert_lost_race");
            return InsertOutcome {
                entry: existing,
                inserted: false,
            };
        }

        let old = self.inner.load_full();
        let mut new_map = (*old).clone();
        new_map.insert(key, Arc::clone(&entry));
        self.inner.store(Arc::new(new_map));
        drop(guard);

        self.update_count.fetch_add(1, Ordering::Relaxed);
        InsertOutcome {
            entry,
            inserted: true,
        }
    }

    /// Remove a key. Returns the removed entry if it was present.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.remove_if(key, |_| true)
    }

    /// Remove a key only if `pred` holds for the current entry.
    ///
    /// The predicate runs under the write lock, so it observes the entry
    /// that will actually be removed.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<Arc<V>>
    where
        F: FnOnce(&Arc<V>) -> bool,
    {
        let guard = self.write_lock.lock();
        let old = self.inner.load_full();
        let entry = old.get(key)?;
        if !pred(entry) {
            return None;
        }
        let removed = Arc::clone(entry);
        let mut new_map = (*old).clone();
        new_map.remove(key);
        self.inner.store(Arc::new(new_map));
        drop(guard);

        self.update_count.fetch_add(1, Ordering::Relaxed);
        Some(removed)
    }

    /// Publish an empty table, returning the previous snapshot.
    ///
    /// Entries stay alive for readers that still hold them.
    pub fn clear(&self) -> Arc<HashMap<K, Arc<V>>> {
        let guard = self.write_lock.lock();
        let old = self.inner.swap(Arc::new(HashMap::new()));
        drop(guard);
        self.update_count.fetch_add(1, Ordering::Relaxed);
        old
    }

    /// Lock-free snapshot of the whole table.
    #[inline]
    pub fn snapshot(&self) -> Arc<HashMap<K, Arc<V>>> {
        self.inner.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn cell_basic_store_load() {
        let cell = RcuCell::new(42_u64);
        assert_eq!(*cell.load(), 42);

        cell.store(100);
        assert_eq!(*cell.load(), 100);
        assert_eq!(cell.update_count(), 1);
    }

    #[test]
    fn cell_old_value_survives_store() {
        let cell = RcuCell::new("original".to_owned());
        let pinned = cell.load();
        cell.store("updated".to_owned());

        assert_eq!(pinned.as_str(), "original");
        assert_eq!(cell.load().as_str(), "updated");
    }

    #[test]
    fn cell_swap_returns_old() {
        let cell = RcuCell::new(1_u32);
        let old = cell.swap(2);
        assert_eq!(*old, 1);
        assert_eq!(*cell.load(), 2);
    }

    #[test]
    fn table_insert_lookup_remove() {
        let table: RcuTable<u64, String> = RcuTable::new();
        assert!(table.is_empty());

        let outcome = table.insert_or_get(1, Arc::new("one".to_owned()));
        assert!(outcome.inserted);
        assert_eq!(table.lookup(&1).unwrap().as_str(), "one");

        let outcome = table.insert_or_get(1, Arc::new("other".to_owned()));
        assert!(!outcome.inserted);
        assert_eq!(outcome.entry.as_str(), "one");
        assert_eq!(table.len(), 1);

        assert!(table.remove(&1).is_some());
        assert!(table.lookup(&1).is_none());
        assert!(table.remove(&1).is_none());
    }

    #[test]
    fn table_remove_if_respects_predicate() {
        let table: RcuTable<u64, u64> = RcuTable::new();
        let _ = table.insert_or_get(5, Arc::new(50));

        assert!(table.remove_if(&5, |v| **v == 51).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.remove_if(&5, |v| **v == 50).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn table_removed_entry_stays_pinned() {
        let table: RcuTable<u64, Vec<u8>> = RcuTable::new();
        let _ = table.insert_or_get(9, Arc::new(vec![9_u8; 16]));

        let pinned = table.lookup(&9).unwrap();
        let removed = table.remove(&9).unwrap();
        assert!(Arc::ptr_eq(&pinned, &removed));

        // The entry outlives its table presence until the pins drop.
        assert_eq!(pinned[0], 9);
        assert!(table.lookup(&9).is_none());
    }

    #[test]
    fn table_concurrent_insert_converges() {
        let table = Arc::new(RcuTable::<u64, u64>::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let outcome = table.insert_or_get(7, Arc::new(i));
                    *outcome.entry
                })
            })
            .collect();

        let values: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = values[0];
        assert!(values.iter().all(|v| *v == first));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_concurrent_readers_and_writer() {
        let table = Arc::new(RcuTable::<u64, u64>::new());
        let barrier = Arc::new(Barrier::new(5));

        let writer = {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..500 {
                    let _ = table.insert_or_get(i, Arc::new(i * 10));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5_000 {
                        let snap = table.snapshot();
                        for (k, v) in snap.iter() {
                            assert_eq!(**v, *k * 10);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(table.len(), 500);
    }
}
