//! Recycling index allocator: 1-based integer handles into a chunked
//! backing store, with freed handles reused in LIFO order.
//!
//! A handle is an index, not an address, so it means the same thing in
//! every copy of the structure that refers to it. The store grows by whole
//! chunks drawn from the wrapped allocator (a [`PoolAllocator`] unless
//! another is supplied to [`RecyclingAllocator::wrap`]); existing slots never
//! move, which keeps [`resolve`](Allocator::resolve) results stable while
//! other handles are being allocated.

use crate::alloc::{AllocError, Allocator, AllocatorId};
use crate::pool::{MemoryPool, PoolAllocator};
use core::mem::MaybeUninit;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use std::sync::Arc;
use tracing::trace;

/// Slots per backing-store chunk.
pub const CHUNK_SLOTS: usize = 256;

/// Generation-free, 1-based index into a [`RecyclingAllocator`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// `None` for the reserved handle 0.
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Handle)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }

    fn from_index(index: usize) -> Self {
        Handle(NonZeroUsize::MIN.saturating_add(index))
    }

    fn index(self) -> usize {
        self.0.get() - 1
    }
}

/// Hands out [`Handle`]s into chunks drawn from the wrapped allocator `A`.
pub struct RecyclingAllocator<T, A = PoolAllocator<MaybeUninit<T>>>
where
    A: Allocator<MaybeUninit<T>>,
{
    inner: A,
    chunks: Vec<A::Pointer>,
    len: usize,
    free: Vec<Handle>,
}

impl<T> RecyclingAllocator<T> {
    /// A recycling allocator whose chunks come from the global heap.
    pub fn new() -> Self {
        Self::wrap(PoolAllocator::new())
    }

    pub fn with_pool(pool: Arc<dyn MemoryPool>) -> Self {
        Self::wrap(PoolAllocator::with_pool(pool))
    }
}

impl<T, A> RecyclingAllocator<T, A>
where
    A: Allocator<MaybeUninit<T>>,
{
    pub fn wrap(inner: A) -> Self {
        Self {
            inner,
            chunks: Vec::new(),
            len: 0,
            free: Vec::new(),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Number of slots ever appended to the backing store.
    pub fn backing_len(&self) -> usize {
        self.len
    }

    /// Number of handles waiting on the free list.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Handles currently handed out.
    pub fn live(&self) -> usize {
        self.len - self.free.len()
    }

    /// Give every chunk back to the wrapped allocator and forget all
    /// handles. Values still constructed in slots are leaked, not dropped.
    pub fn reset(&mut self) {
        if self.chunks.is_empty() {
            return;
        }
        trace!(chunks = self.chunks.len(), slots = self.len, "releasing backing store");
        for chunk in self.chunks.drain(..) {
            // SAFETY: every chunk was allocated with CHUNK_SLOTS elements,
            // and slot contents are MaybeUninit so nothing needs dropping.
            unsafe { self.inner.deallocate(chunk, CHUNK_SLOTS) };
        }
        self.len = 0;
        self.free.clear();
        self.inner.release();
    }

    fn grow(&mut self) -> Result<(), AllocError> {
        let chunk = self.inner.allocate(CHUNK_SLOTS)?;
        self.chunks.push(chunk);
        trace!(chunks = self.chunks.len(), "grew backing store");
        Ok(())
    }
}

impl<T> Default for RecyclingAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A> Drop for RecyclingAllocator<T, A>
where
    A: Allocator<MaybeUninit<T>>,
{
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T, A> Allocator<T> for RecyclingAllocator<T, A>
where
    A: Allocator<MaybeUninit<T>>,
{
    type Pointer = Handle;

    const RECYCLE_SPACE: bool = true;
    const THREAD_SAFE: bool = false;

    /// Single-element granularity only: `n > 1` is rejected.
    fn allocate(&mut self, n: usize) -> Result<Handle, AllocError> {
        if n > 1 {
            return Err(AllocError::Granularity { requested: n });
        }
        if let Some(h) = self.free.pop() {
            return Ok(h);
        }
        if self.len == usize::MAX {
            return Err(AllocError::CapacityOverflow {
                count: self.len,
                allocator: AllocatorId::Recycling,
            });
        }
        if self.len == self.chunks.len() * CHUNK_SLOTS {
            self.grow()?;
        }
        let h = Handle::from_index(self.len);
        self.len += 1;
        Ok(h)
    }

    /// # Safety
    /// Besides the trait contract: `p` must not already be on the free
    /// list. A double free hands the same slot out twice.
    unsafe fn deallocate(&mut self, p: Handle, _n: usize) {
        self.free.push(p);
    }

    /// # Panics
    /// If `p` lies beyond the backing store.
    fn resolve(&self, p: Handle) -> NonNull<T> {
        let index = p.index();
        assert!(index < self.len, "handle {} out of range", p.get());
        let chunk = self.inner.resolve(self.chunks[index / CHUNK_SLOTS]);
        // SAFETY: the offset stays inside a CHUNK_SLOTS-element chunk.
        unsafe { NonNull::new_unchecked(chunk.as_ptr().add(index % CHUNK_SLOTS)).cast() }
    }

    fn max_size(&self) -> usize {
        1
    }

    fn release(&mut self) {
        if self.live() == 0 {
            self.reset();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::BoundedPool;

    #[test]
    fn handles_are_one_based_and_sequential() {
        let mut a: RecyclingAllocator<u32> = RecyclingAllocator::new();
        let h1 = a.allocate(1).unwrap();
        let h2 = a.allocate(1).unwrap();
        assert_eq!(h1.get(), 1);
        assert_eq!(h2.get(), 2);
        assert_eq!(a.backing_len(), 2);
        assert!(Handle::new(0).is_none());
    }

    #[test]
    fn freed_handles_are_recycled_lifo() {
        let mut a: RecyclingAllocator<u32> = RecyclingAllocator::new();
        let hs: Vec<_> = (0..3).map(|_| a.allocate(1).unwrap()).collect();
        unsafe {
            a.deallocate(hs[0], 1);
            a.deallocate(hs[2], 1);
        }
        assert_eq!(a.free_len(), 2);
        assert_eq!(a.allocate(1).unwrap(), hs[2]);
        assert_eq!(a.allocate(1).unwrap(), hs[0]);
        // Free list drained: the store grows again.
        assert_eq!(a.allocate(1).unwrap().get(), 4);
        assert_eq!(a.live(), 4);
    }

    #[test]
    fn bulk_requests_are_rejected() {
        let mut a: RecyclingAllocator<u32> = RecyclingAllocator::new();
        assert_eq!(a.allocate(2), Err(AllocError::Granularity { requested: 2 }));
        assert_eq!(a.backing_len(), 0);
    }

    #[test]
    fn values_survive_growth_across_chunks() {
        let mut a: RecyclingAllocator<String> = RecyclingAllocator::new();
        let hs: Vec<_> = (0..CHUNK_SLOTS * 3 + 7)
            .map(|i| {
                let h = a.allocate(1).unwrap();
                unsafe { a.construct(h, i.to_string()) };
                h
            })
            .collect();
        for (i, &h) in hs.iter().enumerate() {
            assert_eq!(unsafe { a.resolve(h).as_ref() }, &i.to_string());
        }
        for h in hs {
            drop(unsafe { a.destroy(h) });
            unsafe { a.deallocate(h, 1) };
        }
        assert_eq!(a.live(), 0);
    }

    #[test]
    fn release_returns_chunks_to_the_pool() {
        let pool = Arc::new(BoundedPool::unbounded());
        let mut a: RecyclingAllocator<u64> = RecyclingAllocator::with_pool(pool.clone());
        let hs: Vec<_> = (0..CHUNK_SLOTS + 1).map(|_| a.allocate(1).unwrap()).collect();
        assert_eq!(pool.live_blocks(), 2);

        // Still referenced: release keeps the store.
        a.release();
        assert_eq!(pool.live_blocks(), 2);

        for h in hs {
            unsafe { a.deallocate(h, 1) };
        }
        a.release();
        assert_eq!(pool.live_blocks(), 0);
        assert_eq!(a.backing_len(), 0);
        assert_eq!(a.allocate(1).unwrap().get(), 1);
    }

    #[test]
    fn exhausted_pool_surfaces_allocation_failure() {
        let pool = Arc::new(BoundedPool::new(0));
        let mut a: RecyclingAllocator<u64> = RecyclingAllocator::with_pool(pool);
        assert!(matches!(
            a.allocate(1),
            Err(AllocError::Exhausted { allocator: AllocatorId::Pool(_), .. })
        ));
        assert_eq!(a.backing_len(), 0);
    }

    #[test]
    fn drop_releases_backing_store() {
        let pool = Arc::new(BoundedPool::unbounded());
        {
            let mut a: RecyclingAllocator<u8> = RecyclingAllocator::with_pool(pool.clone());
            let _ = a.allocate(1).unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn resolving_a_foreign_handle_panics() {
        let a: RecyclingAllocator<u8> = RecyclingAllocator::new();
        let _ = a.resolve(Handle::new(5).unwrap());
    }

    #[test]
    fn max_size_matches_what_allocate_accepts() {
        let mut a: RecyclingAllocator<u64> = RecyclingAllocator::new();
        assert_eq!(a.max_size(), 1);
        assert!(a.allocate(a.max_size()).is_ok());
        assert!(a.allocate(a.max_size() + 1).is_err());

        let p: PoolAllocator<u64> = PoolAllocator::new();
        assert_eq!(p.max_size(), usize::MAX / 8);
    }

    // Counts chunk requests reaching the wrapped strategy.
    struct Counting {
        inner: PoolAllocator<MaybeUninit<u16>>,
        allocs: usize,
        frees: usize,
    }

    impl Allocator<MaybeUninit<u16>> for Counting {
        type Pointer = NonNull<MaybeUninit<u16>>;

        const RECYCLE_SPACE: bool = true;
        const THREAD_SAFE: bool = false;

        fn allocate(&mut self, n: usize) -> Result<Self::Pointer, AllocError> {
            self.allocs += 1;
            self.inner.allocate(n)
        }

        unsafe fn deallocate(&mut self, p: Self::Pointer, n: usize) {
            self.frees += 1;
            unsafe { self.inner.deallocate(p, n) }
        }

        fn resolve(&self, p: Self::Pointer) -> NonNull<MaybeUninit<u16>> {
            self.inner.resolve(p)
        }
    }

    #[test]
    fn wraps_any_inner_strategy() {
        let mut a: RecyclingAllocator<u16, Counting> = RecyclingAllocator::wrap(Counting {
            inner: PoolAllocator::new(),
            allocs: 0,
            frees: 0,
        });
        let hs: Vec<Handle> = (0..CHUNK_SLOTS + 1)
            .map(|i| {
                let h = a.allocate(1).unwrap();
                unsafe { a.construct(h, i as u16) };
                h
            })
            .collect();
        assert_eq!(a.inner().allocs, 2);
        assert_eq!(unsafe { *a.resolve(hs[CHUNK_SLOTS]).as_ref() }, CHUNK_SLOTS as u16);

        for h in hs {
            unsafe { a.deallocate(h, 1) };
        }
        a.release();
        assert_eq!(a.inner().frees, 2);
    }

    #[test]
    fn traits_are_queryable() {
        assert!(<RecyclingAllocator<u8> as Allocator<u8>>::RECYCLE_SPACE);
        assert!(!<RecyclingAllocator<u8> as Allocator<u8>>::THREAD_SAFE);
        assert!(<PoolAllocator<u8> as Allocator<u8>>::THREAD_SAFE);
    }
}
