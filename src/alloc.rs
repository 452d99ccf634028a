//! The allocator capability shared by every table storage strategy.

use core::fmt;
use core::ptr::NonNull;
use thiserror::Error;

/// Identifies which allocator failed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AllocatorId {
    /// The global heap (a pool allocator with no bound pool).
    Heap,
    /// A bound memory pool, by address.
    Pool(usize),
    /// A recycling index allocator.
    Recycling,
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorId::Heap => f.write_str("heap"),
            AllocatorId::Pool(addr) => write!(f, "pool@{addr:#x}"),
            AllocatorId::Recycling => f.write_str("recycling"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AllocError {
    #[error("{allocator} allocator could not provide {size} bytes")]
    Exhausted { size: usize, allocator: AllocatorId },
    #[error("{allocator} allocator cannot lay out {count} elements")]
    CapacityOverflow { count: usize, allocator: AllocatorId },
    #[error("recycling allocator hands out single elements, {requested} requested")]
    Granularity { requested: usize },
}

/// Storage capability: hand out storage for `T`, construct and destroy
/// values in it, and give it back.
///
/// `Pointer` is whatever the allocator uses to name storage: a raw
/// pointer for pool-backed memory, a [`Handle`](crate::recycle::Handle)
/// for the recycling allocator. Tables only ever store `Pointer`s and
/// turn them into addresses with [`resolve`](Allocator::resolve) at the
/// point of use.
///
/// Misuse (freeing twice, freeing with the wrong count, touching storage
/// after freeing it) is not detected at runtime; the corresponding methods
/// are `unsafe` and document their preconditions.
pub trait Allocator<T> {
    type Pointer: Copy + Eq + fmt::Debug;

    /// Whether `deallocate` makes storage reusable immediately.
    const RECYCLE_SPACE: bool;
    /// Whether one instance may be used from several threads at once.
    const THREAD_SAFE: bool;

    /// Obtain uninitialized storage for `n` consecutive values.
    fn allocate(&mut self, n: usize) -> Result<Self::Pointer, AllocError>;

    /// Return storage obtained from [`allocate`](Allocator::allocate).
    ///
    /// # Safety
    /// `p` must come from this allocator with the same `n`, must not have
    /// been deallocated since, and any value constructed in it must already
    /// have been destroyed or moved out.
    unsafe fn deallocate(&mut self, p: Self::Pointer, n: usize);

    /// Address of the storage named by `p`.
    fn resolve(&self, p: Self::Pointer) -> NonNull<T>;

    /// Largest `n` that [`allocate`](Allocator::allocate) could accept.
    fn max_size(&self) -> usize {
        usize::MAX / core::mem::size_of::<T>().max(1)
    }

    /// Hand back backing storage no live value refers to. Storage strategies
    /// that free eagerly have nothing to do here.
    fn release(&mut self) {}

    /// Move `value` into the storage at `p`.
    ///
    /// # Safety
    /// `p` must be live storage from this allocator that does not currently
    /// hold a value.
    unsafe fn construct(&mut self, p: Self::Pointer, value: T) {
        unsafe { self.resolve(p).as_ptr().write(value) }
    }

    /// Move the value at `p` out, leaving the storage uninitialized.
    ///
    /// # Safety
    /// `p` must hold a value previously placed with
    /// [`construct`](Allocator::construct).
    unsafe fn destroy(&mut self, p: Self::Pointer) -> T {
        unsafe { self.resolve(p).as_ptr().read() }
    }
}
