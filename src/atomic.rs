//! Lock-free atomic primitives over fixed-width words and pointers.
//!
//! Every operation is a single read-modify-write with `SeqCst` ordering, so
//! two concurrent operations on the same location are always observed as
//! one fully before the other. Arithmetic wraps on overflow. Signed values
//! are handled through two's complement casts: subtracting `n` is
//! `add(word, n.wrapping_neg())`.
//!
//! Return conventions:
//! - `increment` / `decrement` return the value *after* the operation.
//! - `add`, `exchange` and `compare_and_exchange` return the value *before*
//!   the operation. `compare_and_exchange` stored `new` iff the returned
//!   value equals `expected`.

use crate::sync::atomic::{
    AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

/// Atomic exchange and compare-and-exchange.
pub trait AtomicSwap {
    type Value: Copy + Eq;

    /// Stores `new` and returns the previous value.
    fn exchange(&self, new: Self::Value) -> Self::Value;

    /// Stores `new` if the current value is `expected`. Returns the value
    /// observed before the attempt either way.
    fn compare_and_exchange(&self, new: Self::Value, expected: Self::Value) -> Self::Value;
}

/// Atomic integer arithmetic on top of [`AtomicSwap`].
pub trait AtomicWord: AtomicSwap {
    /// Adds one and returns the new value.
    fn increment(&self) -> Self::Value;

    /// Subtracts one and returns the new value.
    fn decrement(&self) -> Self::Value;

    /// Adds `delta` and returns the previous value.
    fn add(&self, delta: Self::Value) -> Self::Value;
}

macro_rules! impl_atomic_word {
    ($($atomic:ty => $word:ty),* $(,)?) => {$(
        impl AtomicSwap for $atomic {
            type Value = $word;

            #[inline]
            fn exchange(&self, new: $word) -> $word {
                self.swap(new, Ordering::SeqCst)
            }

            #[inline]
            fn compare_and_exchange(&self, new: $word, expected: $word) -> $word {
                match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(prev) | Err(prev) => prev,
                }
            }
        }

        impl AtomicWord for $atomic {
            #[inline]
            fn increment(&self) -> $word {
                self.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
            }

            #[inline]
            fn decrement(&self) -> $word {
                self.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1)
            }

            #[inline]
            fn add(&self, delta: $word) -> $word {
                self.fetch_add(delta, Ordering::SeqCst)
            }
        }
    )*};
}

impl_atomic_word! {
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
}

impl<T> AtomicSwap for AtomicPtr<T> {
    type Value = *mut T;

    #[inline]
    fn exchange(&self, new: *mut T) -> *mut T {
        self.swap(new, Ordering::SeqCst)
    }

    #[inline]
    fn compare_and_exchange(&self, new: *mut T, expected: *mut T) -> *mut T {
        match self.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) | Err(prev) => prev,
        }
    }
}

#[inline]
pub fn increment<A: AtomicWord>(word: &A) -> A::Value {
    word.increment()
}

#[inline]
pub fn decrement<A: AtomicWord>(word: &A) -> A::Value {
    word.decrement()
}

#[inline]
pub fn add<A: AtomicWord>(word: &A, delta: A::Value) -> A::Value {
    word.add(delta)
}

#[inline]
pub fn exchange<A: AtomicSwap>(word: &A, new: A::Value) -> A::Value {
    word.exchange(new)
}

#[inline]
pub fn compare_and_exchange<A: AtomicSwap>(word: &A, new: A::Value, expected: A::Value) -> A::Value {
    word.compare_and_exchange(new, expected)
}
