//! Pool-backed allocation: the `MemoryPool` binding interface, the typed
//! `PoolAllocator` that delegates to it (or to the global heap), and
//! `BoundedPool`, a budget-limited pool with lock-free accounting.

use crate::alloc::{AllocError, Allocator, AllocatorId};
use crate::atomic;
use crate::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::alloc::Layout;
use std::sync::Arc;

/// An externally owned source of raw memory.
///
/// Pools are shared between allocators (and therefore tables) by cloning
/// the `Arc` they are bound through, so implementations must tolerate
/// concurrent calls. Allocators never ask a pool for zero bytes.
pub trait MemoryPool: Send + Sync {
    /// Returns a block fitting `layout`, or `None` when the pool is exhausted.
    fn malloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block to the pool.
    ///
    /// # Safety
    /// `ptr` must have been returned by `malloc` on this pool with the same
    /// `layout` and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Typed allocator over a bound [`MemoryPool`], or the global heap when
/// unbound. Two instances compare equal iff they are bound to the same pool
/// or are both unbound.
pub struct PoolAllocator<T> {
    pool: Option<Arc<dyn MemoryPool>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolAllocator<T> {
    /// A heap-backed allocator.
    pub fn new() -> Self {
        Self {
            pool: None,
            _marker: PhantomData,
        }
    }

    pub fn with_pool(pool: Arc<dyn MemoryPool>) -> Self {
        Self {
            pool: Some(pool),
            _marker: PhantomData,
        }
    }

    pub fn pool(&self) -> Option<&Arc<dyn MemoryPool>> {
        self.pool.as_ref()
    }

    /// An allocator for another element type drawing from the same source.
    pub fn rebind<U>(&self) -> PoolAllocator<U> {
        PoolAllocator {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> AllocatorId {
        match &self.pool {
            Some(pool) => AllocatorId::Pool(Arc::as_ptr(pool) as *const () as usize),
            None => AllocatorId::Heap,
        }
    }
}

impl<T> Default for PoolAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PoolAllocator<T> {
    fn clone(&self) -> Self {
        self.rebind()
    }
}

impl<T> PartialEq for PoolAllocator<T> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.pool, &other.pool) {
            (Some(a), Some(b)) => core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T> Eq for PoolAllocator<T> {}

impl<T> fmt::Debug for PoolAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolAllocator").field(&self.id()).finish()
    }
}

impl<T> Allocator<T> for PoolAllocator<T> {
    type Pointer = NonNull<T>;

    const RECYCLE_SPACE: bool = true;
    const THREAD_SAFE: bool = true;

    fn allocate(&mut self, n: usize) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::array::<T>(n).map_err(|_| AllocError::CapacityOverflow {
            count: n,
            allocator: self.id(),
        })?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        let raw = match &self.pool {
            Some(pool) => pool.malloc(layout),
            // SAFETY: layout has non-zero size.
            None => NonNull::new(unsafe { std::alloc::alloc(layout) }),
        };
        raw.map(NonNull::cast).ok_or_else(|| AllocError::Exhausted {
            size: layout.size(),
            allocator: self.id(),
        })
    }

    unsafe fn deallocate(&mut self, p: NonNull<T>, n: usize) {
        let Ok(layout) = Layout::array::<T>(n) else {
            return;
        };
        if layout.size() == 0 {
            return;
        }
        match &self.pool {
            Some(pool) => unsafe { pool.free(p.cast(), layout) },
            None => unsafe { std::alloc::dealloc(p.as_ptr().cast(), layout) },
        }
    }

    #[inline]
    fn resolve(&self, p: NonNull<T>) -> NonNull<T> {
        p
    }
}

/// Heap-backed pool with a byte budget.
///
/// Reservations are made with a compare-and-exchange loop on the in-use
/// counter, so a pool can be shared by tables on different threads and
/// never admits more than `limit` bytes in total. `in_use` and
/// `live_blocks` double as leak instrumentation: both return to zero once
/// every block has been freed.
#[derive(Debug)]
pub struct BoundedPool {
    limit: usize,
    in_use: AtomicUsize,
    live_blocks: AtomicUsize,
}

impl BoundedPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
            live_blocks: AtomicUsize::new(0),
        }
    }

    /// A pool that only counts.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Blocks currently handed out.
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::SeqCst)
    }

    fn reserve(&self, size: usize) -> bool {
        let mut current = self.in_use.load(Ordering::SeqCst);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= self.limit => next,
                _ => return false,
            };
            let seen = atomic::compare_and_exchange(&self.in_use, next, current);
            if seen == current {
                return true;
            }
            current = seen;
        }
    }

    fn unreserve(&self, size: usize) {
        atomic::add(&self.in_use, size.wrapping_neg());
    }
}

impl MemoryPool for BoundedPool {
    fn malloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 || !self.reserve(layout.size()) {
            return None;
        }
        // SAFETY: layout has non-zero size.
        match NonNull::new(unsafe { std::alloc::alloc(layout) }) {
            Some(ptr) => {
                atomic::increment(&self.live_blocks);
                Some(ptr)
            }
            None => {
                self.unreserve(layout.size());
                None
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        self.unreserve(layout.size());
        atomic::decrement(&self.live_blocks);
    }
}
