//! OpenHashMap: fixed-capacity open addressing over one contiguous bucket
//! array obtained from a [`PoolAllocator`].
//!
//! Collisions are resolved by linear probing from `hash % capacity`; a probe
//! visits at most `capacity` buckets, so lookups terminate even when every
//! bucket is occupied. Erase uses backward-shift deletion: entries after the
//! hole that may legally move closer to their home bucket are shifted back,
//! so the array never carries tombstones and a re-inserted key is
//! indistinguishable from a first-time insert.

use crate::alloc::{AllocError, Allocator};
use crate::hash::{KeyHash, StdHash};
use crate::pool::{MemoryPool, PoolAllocator};
use crate::reentrancy::ProbeLatch;
use crate::table::{SetOutcome, Table, TableError};
use core::borrow::Borrow;
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

struct Bucket<K, V> {
    hash: u64,
    key: K,
    value: V,
}

type Slot<K, V> = Option<Bucket<K, V>>;

/// `len` initialized slots starting at `ptr`.
struct Buckets<K, V> {
    ptr: NonNull<Slot<K, V>>,
    len: usize,
}

impl<K, V> Buckets<K, V> {
    fn as_slice(&self) -> &[Slot<K, V>] {
        // SAFETY: every slot is written at creation and stays initialized
        // until destroy; ptr is dangling-but-aligned when len == 0.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [Slot<K, V>] {
        // SAFETY: as above, and &mut self gives exclusive access.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

enum Probe {
    Found(usize),
    Vacant(usize),
    Exhausted,
}

#[inline]
fn home(hash: u64, capacity: usize) -> usize {
    (hash % capacity as u64) as usize
}

/// Forward distance from `from` to `to` on a ring of `capacity` buckets.
#[inline]
fn distance(from: usize, to: usize, capacity: usize) -> usize {
    (to + capacity - from) % capacity
}

fn probe<K, V, Q>(slots: &[Slot<K, V>], hash: u64, key: &Q) -> Probe
where
    K: Borrow<Q>,
    Q: ?Sized + Eq,
{
    let capacity = slots.len();
    if capacity == 0 {
        return Probe::Exhausted;
    }
    let start = home(hash, capacity);
    for step in 0..capacity {
        let i = (start + step) % capacity;
        match &slots[i] {
            None => return Probe::Vacant(i),
            Some(b) if b.hash == hash && b.key.borrow() == key => return Probe::Found(i),
            Some(_) => {}
        }
    }
    Probe::Exhausted
}

/// Close the hole at `hole` by shifting back the entries that follow it.
fn backshift<K, V>(slots: &mut [Slot<K, V>], mut hole: usize) {
    let capacity = slots.len();
    let mut next = (hole + 1) % capacity;
    for _ in 1..capacity {
        let home = match &slots[next] {
            None => break,
            Some(b) => home(b.hash, capacity),
        };
        if distance(home, next, capacity) >= distance(hole, next, capacity) {
            slots.swap(hole, next);
            hole = next;
        }
        next = (next + 1) % capacity;
    }
}

pub struct OpenHashMap<K, V, H = StdHash> {
    hasher: H,
    alloc: PoolAllocator<Slot<K, V>>,
    buckets: Option<Buckets<K, V>>, // None until created
    len: usize,
    reentrancy: ProbeLatch,
}

impl<K, V> OpenHashMap<K, V> {
    pub fn new() -> Self {
        Self::with_hasher(StdHash::default())
    }

    /// Buckets come from `pool` instead of the heap.
    pub fn with_pool(pool: Arc<dyn MemoryPool>) -> Self {
        Self::with_hasher_and_pool(StdHash::default(), pool)
    }
}

impl<K, V> Default for OpenHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> OpenHashMap<K, V, H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self::from_parts(hasher, PoolAllocator::new())
    }

    pub fn with_hasher_and_pool(hasher: H, pool: Arc<dyn MemoryPool>) -> Self {
        Self::from_parts(hasher, PoolAllocator::with_pool(pool))
    }

    fn from_parts(hasher: H, alloc: PoolAllocator<Slot<K, V>>) -> Self {
        Self {
            hasher,
            alloc,
            buckets: None,
            len: 0,
            reentrancy: ProbeLatch::new(),
        }
    }

    pub fn pool(&self) -> Option<&Arc<dyn MemoryPool>> {
        self.alloc.pool()
    }

    /// Release whatever is held, then allocate `capacity` empty buckets.
    pub fn create(&mut self, capacity: usize) -> Result<(), AllocError> {
        self.destroy();
        let ptr = self.alloc.allocate(capacity)?;
        for i in 0..capacity {
            // SAFETY: ptr spans `capacity` uninitialized slots.
            unsafe { ptr.as_ptr().add(i).write(None) };
        }
        self.buckets = Some(Buckets { ptr, len: capacity });
        debug!(capacity, "created open hash map");
        Ok(())
    }

    pub fn destroy(&mut self) {
        let Some(mut buckets) = self.buckets.take() else {
            return;
        };
        self.len = 0;
        let capacity = buckets.len;
        // SAFETY: all slots are initialized; the array is no longer
        // reachable from self, and is given back with the count it was
        // allocated with.
        unsafe {
            core::ptr::drop_in_place(buckets.as_mut_slice());
            self.alloc.deallocate(buckets.ptr, capacity);
        }
        debug!(capacity, "destroyed open hash map");
    }

    pub fn clear(&mut self) {
        if let Some(buckets) = self.buckets.as_mut() {
            buckets.as_mut_slice().iter_mut().for_each(|slot| *slot = None);
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.as_ref().map_or(0, |b| b.len)
    }

    pub fn is_created(&self) -> bool {
        self.buckets.is_some()
    }

    fn slots(&self) -> &[Slot<K, V>] {
        match &self.buckets {
            Some(b) => b.as_slice(),
            None => &[],
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: self.slots().iter(),
        }
    }

    /// Values may be changed in place; keys and layout stay fixed.
    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        let slots: &mut [Slot<K, V>] = match self.buckets.as_mut() {
            Some(b) => b.as_mut_slice(),
            None => &mut [],
        };
        IterMut {
            slots: slots.iter_mut(),
        }
    }
}

impl<K, V, H> OpenHashMap<K, V, H>
where
    K: Eq,
    H: KeyHash<K>,
{
    pub fn set(&mut self, key: K, value: V, overwrite: bool) -> Result<SetOutcome, TableError> {
        let _g = self.reentrancy.enter("set");
        let Some(buckets) = self.buckets.as_mut() else {
            return Err(TableError::InvalidState);
        };
        let hash = self.hasher.hash_key(&key);
        let slots = buckets.as_mut_slice();
        match probe(slots, hash, &key) {
            Probe::Found(i) => {
                if !overwrite {
                    return Ok(SetOutcome::Exists);
                }
                if let Some(b) = &mut slots[i] {
                    b.value = value;
                }
                Ok(SetOutcome::Overwritten)
            }
            Probe::Vacant(i) => {
                slots[i] = Some(Bucket { hash, key, value });
                self.len += 1;
                Ok(SetOutcome::Inserted)
            }
            Probe::Exhausted => Err(TableError::Full {
                capacity: slots.len(),
            }),
        }
    }

    pub fn assign<I>(&mut self, entries: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        Table::assign(self, entries)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        H: KeyHash<Q>,
    {
        let _g = self.reentrancy.enter("get");
        let slots = self.slots();
        if slots.is_empty() {
            return None;
        }
        let hash = self.hasher.hash_key(key);
        match probe(slots, hash, key) {
            Probe::Found(i) => slots[i].as_ref().map(|b| &b.value),
            _ => None,
        }
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        H: KeyHash<Q>,
    {
        let _g = self.reentrancy.enter("get_mut");
        let slots = self.buckets.as_mut()?.as_mut_slice();
        if slots.is_empty() {
            return None;
        }
        let hash = self.hasher.hash_key(key);
        match probe(slots, hash, key) {
            Probe::Found(i) => slots[i].as_mut().map(|b| &mut b.value),
            _ => None,
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        H: KeyHash<Q>,
    {
        self.get(key).is_some()
    }

    pub fn erase<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        H: KeyHash<Q>,
    {
        let _g = self.reentrancy.enter("erase");
        let slots = self.buckets.as_mut()?.as_mut_slice();
        if slots.is_empty() {
            return None;
        }
        let hash = self.hasher.hash_key(key);
        let Probe::Found(index) = probe(slots, hash, key) else {
            return None;
        };
        let removed = slots[index].take()?;
        self.len -= 1;
        backshift(slots, index);
        Some((removed.key, removed.value))
    }
}

impl<K, V, H> Drop for OpenHashMap<K, V, H> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<K: fmt::Debug, V: fmt::Debug, H> fmt::Debug for OpenHashMap<K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, H> Table for OpenHashMap<K, V, H>
where
    K: Eq,
    H: KeyHash<K>,
{
    type Key = K;
    type Value = V;
    type Iter<'a>
        = Iter<'a, K, V>
    where
        Self: 'a;

    fn create(&mut self, capacity: usize) -> Result<(), AllocError> {
        OpenHashMap::create(self, capacity)
    }

    fn destroy(&mut self) {
        OpenHashMap::destroy(self)
    }

    fn clear(&mut self) {
        OpenHashMap::clear(self)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        OpenHashMap::capacity(self)
    }

    fn set(&mut self, key: K, value: V, overwrite: bool) -> Result<SetOutcome, TableError> {
        OpenHashMap::set(self, key, value, overwrite)
    }

    fn get(&self, key: &K) -> Option<&V> {
        OpenHashMap::get(self, key)
    }

    fn erase(&mut self, key: &K) -> Option<(K, V)> {
        OpenHashMap::erase(self, key)
    }

    fn iter(&self) -> Iter<'_, K, V> {
        OpenHashMap::iter(self)
    }
}

/// Iterator over entries of an [`OpenHashMap`], in bucket order.
pub struct Iter<'a, K, V> {
    slots: core::slice::Iter<'a, Slot<K, V>>,
}

impl<K, V> Clone for Iter<'_, K, V> {
    fn clone(&self) -> Self {
        Iter {
            slots: self.slots.clone(),
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.slots
            .by_ref()
            .find_map(|slot| slot.as_ref().map(|b| (&b.key, &b.value)))
    }
}

/// Iterator over entries of an [`OpenHashMap`] with mutable values.
pub struct IterMut<'a, K, V> {
    slots: core::slice::IterMut<'a, Slot<K, V>>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.slots.by_ref().find_map(|slot| {
            slot.as_mut().map(|b| {
                let Bucket { key, value, .. } = b;
                (&*key, value)
            })
        })
    }
}

impl<'a, K, V, H> IntoIterator for &'a OpenHashMap<K, V, H> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, H> IntoIterator for &'a mut OpenHashMap<K, V, H> {
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::BoundedPool;
    use std::collections::{BTreeMap, BTreeSet};

    fn created(capacity: usize) -> OpenHashMap<String, i32> {
        let mut m = OpenHashMap::new();
        m.create(capacity).unwrap();
        m
    }

    /// Invariant: the four `set` outcomes are distinct and observable.
    #[test]
    fn set_reports_each_outcome() {
        let mut m = created(4);
        assert_eq!(m.set("k".into(), 1, false), Ok(SetOutcome::Inserted));
        assert_eq!(m.set("k".into(), 2, false), Ok(SetOutcome::Exists));
        assert_eq!(m.get("k"), Some(&1));
        assert_eq!(m.set("k".into(), 3, true), Ok(SetOutcome::Overwritten));
        assert_eq!(m.get("k"), Some(&3));
        assert_eq!(m.len(), 1);
    }

    /// Invariant: a never-created table rejects writes with `InvalidState`
    /// and behaves as empty for reads.
    #[test]
    fn uninitialized_table_is_inert() {
        let mut m: OpenHashMap<String, i32> = OpenHashMap::new();
        assert!(!m.is_created());
        assert_eq!(m.capacity(), 0);
        assert_eq!(m.set("a".into(), 1, false), Err(TableError::InvalidState));
        assert_eq!(m.get("a"), None);
        assert_eq!(m.erase("a"), None);
        m.clear();
        assert_eq!(m.len(), 0);
    }

    /// Invariant: capacity 0 is valid; inserts report `Full`, lookups miss.
    #[test]
    fn zero_capacity_is_always_full() {
        let mut m = created(0);
        assert!(m.is_created());
        assert_eq!(
            m.set("a".into(), 1, false),
            Err(TableError::Full { capacity: 0 })
        );
        assert_eq!(m.get("a"), None);
        assert_eq!(m.erase("a"), None);
        assert_eq!(m.iter().count(), 0);
    }

    /// Invariant: once every bucket is used, absent keys are `Full` while
    /// present keys can still be overwritten.
    #[test]
    fn full_table_still_overwrites() {
        let mut m = created(3);
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(m.set((*k).into(), i as i32, false), Ok(SetOutcome::Inserted));
        }
        assert_eq!(
            m.set("d".into(), 9, false),
            Err(TableError::Full { capacity: 3 })
        );
        assert_eq!(m.get("d"), None);
        assert_eq!(m.set("b".into(), 7, true), Ok(SetOutcome::Overwritten));
        assert_eq!(m.get("b"), Some(&7));
        assert_eq!(m.len(), 3);
    }

    /// Invariant: erase-then-reinsert is a first-time insert.
    #[test]
    fn erase_then_reinsert_is_inserted() {
        let mut m = created(8);
        m.set("k".into(), 1, false).unwrap();
        assert_eq!(m.erase("k"), Some(("k".to_string(), 1)));
        assert_eq!(m.erase("k"), None);
        assert_eq!(m.get("k"), None);
        assert_eq!(m.set("k".into(), 2, true), Ok(SetOutcome::Inserted));
        assert_eq!(m.get("k"), Some(&2));
    }

    /// Invariant: with all keys hashing alike, equality alone separates
    /// entries, and removing from the middle of a cluster keeps every other
    /// member reachable.
    #[test]
    fn collisions_resolve_through_equality() {
        let mut m: OpenHashMap<String, i32, fn(&String) -> u64> =
            OpenHashMap::with_hasher(|_: &String| 0);
        m.create(5).unwrap();
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            m.set((*k).into(), i as i32, false).unwrap();
        }
        assert_eq!(m.erase(&"b".to_string()), Some(("b".into(), 1)));
        assert_eq!(m.get(&"a".to_string()), Some(&0));
        assert_eq!(m.get(&"c".to_string()), Some(&2));
        assert_eq!(m.get(&"d".to_string()), Some(&3));
        assert_eq!(m.len(), 3);
    }

    /// Invariant: backward shift across the end of the array keeps wrapped
    /// clusters reachable and never moves an entry ahead of its home bucket.
    #[test]
    fn backshift_handles_wraparound() {
        // Keys hash to themselves; capacity 4 puts homes at key % 4.
        let mut m = OpenHashMap::with_hasher(|k: &u64| *k);
        m.create(4).unwrap();
        m.set(3u64, "three", false).unwrap(); // bucket 3
        m.set(7, "seven", false).unwrap(); // home 3, wraps to 0
        m.set(1, "one", false).unwrap(); // bucket 1, at home
        m.set(11, "eleven", false).unwrap(); // home 3, lands in 2

        assert_eq!(m.erase(&3), Some((3, "three")));
        assert_eq!(m.get(&7), Some(&"seven"));
        assert_eq!(m.get(&11), Some(&"eleven"));
        assert_eq!(m.get(&1), Some(&"one"));

        // One bucket free again: an absent key probes without looping.
        assert_eq!(m.get(&15), None);
        assert_eq!(m.set(15, "fifteen", false), Ok(SetOutcome::Inserted));
        assert_eq!(m.set(19, "x", false), Err(TableError::Full { capacity: 4 }));
    }

    /// Invariant: borrowed lookup works (store `String`, query with `&str`).
    #[test]
    fn borrowed_lookup_with_str() {
        let mut m = created(4);
        m.set("hello".into(), 1, false).unwrap();
        assert!(m.contains_key("hello"));
        assert!(!m.contains_key("world"));
        *m.get_mut("hello").unwrap() += 1;
        assert_eq!(m.get("hello"), Some(&2));
    }

    /// Invariant: iteration yields every entry once; mutation through
    /// `iter_mut` keeps `len` and the key set and is visible to lookups.
    #[test]
    fn iteration_and_mutation() {
        let mut m = created(16);
        let mut model = BTreeMap::new();
        for (i, k) in ["k1", "k2", "k3", "k4"].iter().enumerate() {
            m.set((*k).into(), i as i32, false).unwrap();
            model.insert(k.to_string(), i as i32);
        }
        let seen: BTreeSet<String> = m.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(seen, model.keys().cloned().collect());

        for (k, v) in &mut m {
            *v += 10;
            *model.get_mut(k).unwrap() += 10;
        }
        assert_eq!(m.len(), model.len());
        for (k, v) in &model {
            assert_eq!(m.get(k.as_str()), Some(v));
        }
        // Restartable: a second pass sees the same entries.
        assert_eq!(m.iter().count(), m.iter().count());
    }

    /// Invariant: `create` and `destroy` can be repeated freely and every
    /// bucket array goes back to the pool.
    #[test]
    fn repeated_lifecycle_does_not_leak() {
        let pool = Arc::new(BoundedPool::unbounded());
        let mut m: OpenHashMap<String, String> = OpenHashMap::with_pool(pool.clone());
        assert!(m.pool().is_some());
        assert!(OpenHashMap::<u8, u8>::new().pool().is_none());
        for _ in 0..100 {
            m.create(100).unwrap();
        }
        assert_eq!(pool.live_blocks(), 1);
        m.set("a".into(), "b".into(), false).unwrap();
        for _ in 0..100 {
            m.destroy();
        }
        assert_eq!(pool.live_blocks(), 0);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(m.len(), 0);
        assert!(!m.is_created());

        m.create(10).unwrap();
        m.set("x".into(), "y".into(), false).unwrap();
        drop(m);
        assert_eq!(pool.in_use(), 0);
    }

    /// Invariant: a failed `create` surfaces the allocation error and leaves
    /// the table uninitialized.
    #[test]
    fn failed_create_leaves_table_uninitialized() {
        let pool = Arc::new(BoundedPool::new(64));
        let mut m: OpenHashMap<u64, u64> = OpenHashMap::with_pool(pool.clone());
        m.create(1).unwrap();
        assert!(matches!(m.create(1 << 20), Err(AllocError::Exhausted { .. })));
        assert!(!m.is_created());
        assert_eq!(pool.in_use(), 0);
    }

    /// Invariant: `clear` drops entries but keeps capacity.
    #[test]
    fn clear_keeps_capacity() {
        let mut m = created(8);
        m.set("a".into(), 1, false).unwrap();
        m.set("b".into(), 2, false).unwrap();
        m.clear();
        assert_eq!(m.len(), 0);
        assert_eq!(m.capacity(), 8);
        assert_eq!(m.get("a"), None);
        assert_eq!(m.set("a".into(), 3, false), Ok(SetOutcome::Inserted));
    }

    #[test]
    fn debug_renders_entries() {
        let mut m = created(2);
        m.set("a".into(), 1, false).unwrap();
        assert_eq!(format!("{m:?}"), r#"{"a": 1}"#);
    }

    /// Invariant (debug-only): re-entering the table from `K: Eq` during a
    /// probe panics.
    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_from_eq_during_get() {
        type Map = OpenHashMap<ReentryKey, i32, fn(&ReentryKey) -> u64>;

        struct ReentryKey {
            id: &'static str,
            map: *const Map,
            trigger: bool,
        }
        impl PartialEq for ReentryKey {
            fn eq(&self, other: &Self) -> bool {
                if self.id == other.id {
                    return true;
                }
                if other.trigger {
                    unsafe {
                        let m = &*other.map;
                        let probe = ReentryKey {
                            id: "zzz",
                            map: core::ptr::null(),
                            trigger: false,
                        };
                        let _ = m.get(&probe);
                    }
                }
                false
            }
        }
        impl Eq for ReentryKey {}

        let mut m: Map = OpenHashMap::with_hasher(|_: &ReentryKey| 0);
        m.create(4).unwrap();
        let key = ReentryKey {
            id: "a",
            map: core::ptr::null(),
            trigger: false,
        };
        m.set(key, 1, false).unwrap();

        let query = ReentryKey {
            id: "b",
            map: &m as *const _,
            trigger: true,
        };
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = m.get(&query);
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
    }
}
