//! PackedHashMap: a hashbrown index of allocator pointers over entries
//! constructed in a pluggable [`Allocator`].
//!
//! The index (`HashTable<A::Pointer>`) only stores pointers; each entry
//! keeps its own hash so the index can be probed and rehashed without
//! calling back into the user hasher. With the default
//! [`RecyclingAllocator`] the pointers are 1-based handles into a packed,
//! chunked store, and slots freed by `erase` are reused by the next insert.
//!
//! Capacity is a policy limit fixed at `create`: the index is reserved for
//! that many entries up front, and inserts beyond it report `Full`.

use crate::alloc::{AllocError, Allocator, AllocatorId};
use crate::hash::{KeyHash, StdHash};
use crate::pool::MemoryPool;
use crate::recycle::RecyclingAllocator;
use crate::reentrancy::ProbeLatch;
use crate::table::{SetOutcome, Table, TableError};
use core::borrow::Borrow;
use core::fmt;
use core::marker::PhantomData;
use hashbrown::{hash_table, HashTable, TryReserveError};
use std::sync::Arc;
use tracing::debug;

/// One stored key-value pair, as laid out in the backing allocator.
pub struct Entry<K, V> {
    hash: u64,
    key: K,
    value: V,
}

/// Shared view of the entry behind `p`.
///
/// # Safety
/// `p` must be indexed, i.e. hold a constructed entry in `slots`.
#[inline]
unsafe fn entry<K, V, A: Allocator<Entry<K, V>>>(slots: &A, p: A::Pointer) -> &Entry<K, V> {
    unsafe { slots.resolve(p).as_ref() }
}

pub struct PackedHashMap<K, V, H = StdHash, A = RecyclingAllocator<Entry<K, V>>>
where
    A: Allocator<Entry<K, V>>,
{
    hasher: H,
    slots: A,
    index: HashTable<A::Pointer>,
    capacity: usize,
    created: bool,
    reentrancy: ProbeLatch,
}

impl<K, V> PackedHashMap<K, V> {
    pub fn new() -> Self {
        Self::with_hasher(StdHash::default())
    }

    /// Entry chunks come from `pool` instead of the heap.
    pub fn with_pool(pool: Arc<dyn MemoryPool>) -> Self {
        Self::with_hasher_in(StdHash::default(), RecyclingAllocator::with_pool(pool))
    }
}

impl<K, V> Default for PackedHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H> PackedHashMap<K, V, H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self::with_hasher_in(hasher, RecyclingAllocator::new())
    }
}

impl<K, V, H, A> PackedHashMap<K, V, H, A>
where
    A: Allocator<Entry<K, V>>,
{
    pub fn with_hasher_in(hasher: H, slots: A) -> Self {
        Self {
            hasher,
            slots,
            index: HashTable::new(),
            capacity: 0,
            created: false,
            reentrancy: ProbeLatch::new(),
        }
    }

    pub fn allocator(&self) -> &A {
        &self.slots
    }

    /// Release whatever is held, then reserve room for `capacity` entries.
    pub fn create(&mut self, capacity: usize) -> Result<(), AllocError> {
        self.destroy();
        self.index.try_reserve(capacity, |_| 0).map_err(|e| match e {
            TryReserveError::CapacityOverflow => AllocError::CapacityOverflow {
                count: capacity,
                allocator: AllocatorId::Heap,
            },
            TryReserveError::AllocError { layout } => AllocError::Exhausted {
                size: layout.size(),
                allocator: AllocatorId::Heap,
            },
        })?;
        self.capacity = capacity;
        self.created = true;
        debug!(capacity, "created packed hash map");
        Ok(())
    }

    pub fn destroy(&mut self) {
        if !self.created {
            return;
        }
        self.clear();
        self.index = HashTable::new();
        self.slots.release();
        debug!(capacity = self.capacity, "destroyed packed hash map");
        self.capacity = 0;
        self.created = false;
    }

    pub fn clear(&mut self) {
        for p in self.index.drain() {
            // SAFETY: every indexed pointer holds a constructed entry, and
            // draining unlinks it so it is never touched again.
            unsafe {
                drop(self.slots.destroy(p));
                self.slots.deallocate(p, 1);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn iter(&self) -> Iter<'_, K, V, A> {
        Iter {
            inner: self.index.iter(),
            slots: &self.slots,
            _marker: PhantomData,
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, K, V, A> {
        IterMut {
            inner: self.index.iter(),
            slots: &self.slots,
            _marker: PhantomData,
        }
    }
}

impl<K, V, H, A> PackedHashMap<K, V, H, A>
where
    K: Eq,
    H: KeyHash<K>,
    A: Allocator<Entry<K, V>>,
{
    fn find<Q>(&self, hash: u64, key: &Q) -> Option<A::Pointer>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let slots = &self.slots;
        self.index
            .find(hash, |&p| {
                // SAFETY: p comes from the index.
                let e = unsafe { entry::<K, V, A>(slots, p) };
                e.hash == hash && e.key.borrow() == key
            })
            .copied()
    }

    pub fn set(&mut self, key: K, value: V, overwrite: bool) -> Result<SetOutcome, TableError> {
        let _g = self.reentrancy.enter("set");
        if !self.created {
            return Err(TableError::InvalidState);
        }
        let hash = self.hasher.hash_key(&key);
        if let Some(p) = self.find(hash, &key) {
            if !overwrite {
                return Ok(SetOutcome::Exists);
            }
            // SAFETY: p is indexed and we hold &mut self.
            unsafe { (*self.slots.resolve(p).as_ptr()).value = value };
            return Ok(SetOutcome::Overwritten);
        }
        if self.index.len() >= self.capacity {
            return Err(TableError::Full {
                capacity: self.capacity,
            });
        }
        let p = self.slots.allocate(1)?;
        // SAFETY: p is fresh storage from this allocator.
        unsafe { self.slots.construct(p, Entry { hash, key, value }) };
        let slots = &self.slots;
        // SAFETY (rehash): every pointer in the index holds an entry.
        self.index
            .insert_unique(hash, p, |&q| unsafe { entry::<K, V, A>(slots, q) }.hash);
        Ok(SetOutcome::Inserted)
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
        if self.index.is_empty() {
            return None;
        }
        let p = self.find(self.hasher.hash_key(key), key)?;
        // SAFETY: p comes from the index.
        Some(&unsafe { entry::<K, V, A>(&self.slots, p) }.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        H: KeyHash<Q>,
    {
        let _g = self.reentrancy.enter("get_mut");
        if self.index.is_empty() {
            return None;
        }
        let p = self.find(self.hasher.hash_key(key), key)?;
        // SAFETY: p is indexed and we hold &mut self.
        Some(unsafe { &mut (*self.slots.resolve(p).as_ptr()).value })
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
        if self.index.is_empty() {
            return None;
        }
        let hash = self.hasher.hash_key(key);
        let slots = &self.slots;
        let (p, _) = self
            .index
            .find_entry(hash, |&p| {
                // SAFETY: p comes from the index.
                let e = unsafe { entry::<K, V, A>(slots, p) };
                e.hash == hash && e.key.borrow() == key
            })
            .ok()?
            .remove();
        // SAFETY: p was just unlinked from the index and holds an entry.
        let removed = unsafe {
            let e = self.slots.destroy(p);
            self.slots.deallocate(p, 1);
            e
        };
        Some((removed.key, removed.value))
    }
}

impl<K, V, H, A> Drop for PackedHashMap<K, V, H, A>
where
    A: Allocator<Entry<K, V>>,
{
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<K, V, H, A> fmt::Debug for PackedHashMap<K, V, H, A>
where
    K: fmt::Debug,
    V: fmt::Debug,
    A: Allocator<Entry<K, V>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, H, A> Table for PackedHashMap<K, V, H, A>
where
    K: Eq,
    H: KeyHash<K>,
    A: Allocator<Entry<K, V>>,
{
    type Key = K;
    type Value = V;
    type Iter<'a>
        = Iter<'a, K, V, A>
    where
        Self: 'a;

    fn create(&mut self, capacity: usize) -> Result<(), AllocError> {
        PackedHashMap::create(self, capacity)
    }

    fn destroy(&mut self) {
        PackedHashMap::destroy(self)
    }

    fn clear(&mut self) {
        PackedHashMap::clear(self)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn set(&mut self, key: K, value: V, overwrite: bool) -> Result<SetOutcome, TableError> {
        PackedHashMap::set(self, key, value, overwrite)
    }

    fn get(&self, key: &K) -> Option<&V> {
        PackedHashMap::get(self, key)
    }

    fn erase(&mut self, key: &K) -> Option<(K, V)> {
        PackedHashMap::erase(self, key)
    }

    fn iter(&self) -> Iter<'_, K, V, A> {
        PackedHashMap::iter(self)
    }
}

/// Iterator over entries of a [`PackedHashMap`], in index order.
pub struct Iter<'a, K, V, A: Allocator<Entry<K, V>>> {
    inner: hash_table::Iter<'a, A::Pointer>,
    slots: &'a A,
    _marker: PhantomData<&'a (K, V)>,
}

impl<'a, K, V, A: Allocator<Entry<K, V>>> Iterator for Iter<'a, K, V, A> {
    type Item = (&'a K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let &p = self.inner.next()?;
        // SAFETY: p comes from the index.
        let e = unsafe { entry::<K, V, A>(self.slots, p) };
        Some((&e.key, &e.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Iterator over entries of a [`PackedHashMap`] with mutable values.
pub struct IterMut<'a, K, V, A: Allocator<Entry<K, V>>> {
    inner: hash_table::Iter<'a, A::Pointer>,
    slots: &'a A,
    _marker: PhantomData<(&'a K, &'a mut V)>,
}

impl<'a, K, V, A: Allocator<Entry<K, V>>> Iterator for IterMut<'a, K, V, A> {
    type Item = (&'a K, &'a mut V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let &p = self.inner.next()?;
        // SAFETY: the map is mutably borrowed for 'a and indexed pointers
        // are distinct, so each entry is handed out once.
        let e = unsafe { &mut *self.slots.resolve(p).as_ptr() };
        Some((&e.key, &mut e.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a, K, V, H, A> IntoIterator for &'a PackedHashMap<K, V, H, A>
where
    A: Allocator<Entry<K, V>>,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, K, V, H, A> IntoIterator for &'a mut PackedHashMap<K, V, H, A>
where
    A: Allocator<Entry<K, V>>,
{
    type Item = (&'a K, &'a mut V);
    type IntoIter = IterMut<'a, K, V, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}
