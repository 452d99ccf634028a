//! Caller-supplied hash functions.
//!
//! Tables never ask the key type to hash itself; they hold a `KeyHash`
//! value and call it. Any `Fn(&K) -> u64` qualifies, and [`StdHash`] adapts
//! a standard [`BuildHasher`] for keys implementing [`Hash`], which also
//! enables borrowed lookups (store `String`, query with `&str`).

use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;

pub trait KeyHash<K: ?Sized> {
    fn hash_key(&self, key: &K) -> u64;
}

impl<K: ?Sized, F> KeyHash<K> for F
where
    F: Fn(&K) -> u64,
{
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self(key)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StdHash<S = RandomState>(pub S);

impl<K, S> KeyHash<K> for StdHash<S>
where
    K: ?Sized + Hash,
    S: BuildHasher,
{
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self.0.hash_one(key)
    }
}
