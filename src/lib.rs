//! pool-hashmap: fixed-capacity hash tables over pluggable storage
//! allocators, with a portable binary archive and the lock-free atomic
//! primitives the allocators are built on.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: one table contract with two storage strategies, so callers pick
//!   memory behavior without changing how they use the table.
//! - Layers:
//!   - `atomic`: increment/decrement/add/exchange/compare-and-exchange on
//!     8/16/32/64-bit and pointer-sized words.
//!   - `alloc` + `pool` + `recycle`: the `Allocator` capability, a typed
//!     `PoolAllocator` bound to a shared `MemoryPool` (or the heap), and a
//!     `RecyclingAllocator` that hands out 1-based index handles and reuses
//!     freed ones.
//!   - `table`: the `Table` trait (`create`/`destroy`/`clear`/`set`/`get`/
//!     `erase`/`assign`/`iter`).
//!   - `OpenHashMap`: one contiguous bucket array, linear probing with
//!     backward-shift erase.
//!   - `PackedHashMap`: a hashbrown index of allocator pointers over
//!     entries packed in a recycling store.
//!   - `archive`: `Encode`/`Decode`/`Restore` and a `BinArchive` stream
//!     wrapper; tables archive as capacity, size and pairs.
//!
//! Lifecycle
//! - A table starts uninitialized. `create(n)` releases whatever it held
//!   and allocates for exactly `n` entries; `destroy` drops entries and
//!   returns storage. Both are idempotent and may be repeated in any order.
//!   `Drop` destroys.
//! - `set` on an uninitialized table is `InvalidState`; an absent key in a
//!   table holding `capacity` entries is `Full`. Capacity never grows.
//!
//! Hasher and rehashing invariants
//! - Tables call a caller-supplied `KeyHash`; `StdHash` adapts any
//!   `BuildHasher` and enables borrowed lookups.
//! - Each entry stores its `u64` hash. Probing compares stored hashes
//!   before calling `K: Eq`, and index maintenance never calls user code.
//!
//! Reentrancy policy
//! - Probing methods hold a debug-only guard while `K: Eq` or the hasher
//!   runs; a nested call into the same table from that code panics in
//!   debug builds. Entries removed by `erase` are handed back only after
//!   the structure is consistent again, so their `Drop` may re-enter.
//!
//! Threading
//! - Tables and the recycling allocator are single-threaded. Memory pools
//!   are `Send + Sync` and may be shared between tables through `Arc`;
//!   `BoundedPool` accounts with the `atomic` primitives and never admits
//!   more than its budget.
//!
//! Notes and non-goals
//! - No growth or rehash-on-demand: capacity is fixed per `create`.
//! - No generational handles; freeing a handle twice is a contract
//!   violation (`unsafe`), not a detected error.
//! - The archive is not self-describing: readers must know the types.

pub mod alloc;
pub mod archive;
pub mod atomic;
pub mod hash;
pub mod open_hash_map;
pub mod packed_hash_map;
pub mod pool;
pub mod recycle;
mod reentrancy;
mod sync;
pub mod table;
mod table_proptest;

// Public surface
pub use alloc::{AllocError, Allocator, AllocatorId};
pub use archive::{ArchiveError, BinArchive, Decode, Encode, Restore};
pub use hash::{KeyHash, StdHash};
pub use open_hash_map::OpenHashMap;
pub use packed_hash_map::PackedHashMap;
pub use pool::{BoundedPool, MemoryPool, PoolAllocator};
pub use recycle::{Handle, RecyclingAllocator};
pub use table::{SetOutcome, Table, TableError};
