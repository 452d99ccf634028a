//! Operations common to every table in the crate.

use crate::alloc::AllocError;
use thiserror::Error;

/// Successful outcomes of [`Table::set`]. Callers branch on these, so each
/// is reported distinctly.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SetOutcome {
    /// The key was absent and has been added.
    Inserted,
    /// The key was present and `overwrite` was false; nothing changed.
    Exists,
    /// The key was present and its value has been replaced.
    Overwritten,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TableError {
    /// Every bucket is in use and the key is absent. Capacity is fixed per
    /// `create`; this is a policy limit, not memory exhaustion.
    #[error("table is full (capacity {capacity})")]
    Full { capacity: usize },
    /// The table has not been created.
    #[error("table has not been created")]
    InvalidState,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// The fixed-capacity table contract.
///
/// A table starts uninitialized (capacity 0, nothing allocated), becomes
/// usable after [`create`](Table::create), and returns to uninitialized on
/// [`destroy`](Table::destroy). Both may be called any number of times in
/// any order.
pub trait Table {
    type Key;
    type Value;
    type Iter<'a>: Iterator<Item = (&'a Self::Key, &'a Self::Value)>
    where
        Self: 'a;

    /// Drop all entries and storage, then allocate room for `capacity`
    /// entries. On failure the table is left uninitialized.
    fn create(&mut self, capacity: usize) -> Result<(), AllocError>;

    /// Drop all entries and release all storage.
    fn destroy(&mut self);

    /// Drop all entries, keeping storage and capacity.
    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn set(
        &mut self,
        key: Self::Key,
        value: Self::Value,
        overwrite: bool,
    ) -> Result<SetOutcome, TableError>;

    fn get(&self, key: &Self::Key) -> Option<&Self::Value>;

    /// Remove `key`, returning the stored pair; `None` if it was absent.
    fn erase(&mut self, key: &Self::Key) -> Option<(Self::Key, Self::Value)>;

    /// Entries in table-internal order.
    fn iter(&self) -> Self::Iter<'_>;

    /// Replace the contents with `entries`; later duplicates win.
    ///
    /// Entries are inserted in input order. If the input holds more
    /// distinct keys than the capacity allows, insertion stops at the first
    /// key that does not fit and `Full` is returned; the table then holds
    /// the entries inserted so far.
    fn assign<I>(&mut self, entries: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = (Self::Key, Self::Value)>,
        Self: Sized,
    {
        self.clear();
        for (key, value) in entries {
            self.set(key, value, true)?;
        }
        Ok(())
    }
}
