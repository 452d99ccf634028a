//! Probe latch: catches user code calling back into a table mid-probe.
//!
//! `K: Eq` and the key hasher run while a table is walking its buckets,
//! and `set`/`erase` may have bookkeeping half applied at that point. Each
//! probing method holds the latch for its whole body. Debug builds record
//! which operation holds it and panic on a nested entry, naming both
//! operations. Release builds keep only the zero-sized marker.

use core::marker::PhantomData;

#[derive(Debug, Default)]
pub struct ProbeLatch {
    #[cfg(debug_assertions)]
    held_by: core::cell::Cell<Option<&'static str>>,
    // Tables are single-threaded.
    _not_send: PhantomData<*mut ()>,
}

impl ProbeLatch {
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            held_by: core::cell::Cell::new(None),
            _not_send: PhantomData,
        }
    }

    /// Hold the latch on behalf of `op` until the guard drops.
    ///
    /// # Panics
    /// In debug builds, if another operation on the same table holds it.
    #[inline]
    pub fn enter(&self, op: &'static str) -> ProbeGuard<'_> {
        #[cfg(debug_assertions)]
        if let Some(outer) = self.held_by.replace(Some(op)) {
            panic!("reentrant call: `{op}` entered a table while `{outer}` was probing it");
        }
        #[cfg(not(debug_assertions))]
        let _ = op;
        ProbeGuard { latch: self }
    }

    #[cfg(all(test, debug_assertions))]
    fn holder(&self) -> Option<&'static str> {
        self.held_by.get()
    }
}

pub struct ProbeGuard<'a> {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    latch: &'a ProbeLatch,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.latch.held_by.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::ProbeLatch;

    #[test]
    fn latch_can_be_taken_again_after_release() {
        let latch = ProbeLatch::new();
        drop(latch.enter("get"));
        drop(latch.enter("erase"));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn guard_records_its_operation() {
        let latch = ProbeLatch::new();
        assert_eq!(latch.holder(), None);
        {
            let _g = latch.enter("set");
            assert_eq!(latch.holder(), Some("set"));
        }
        assert_eq!(latch.holder(), None);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "`get` entered a table while `erase` was probing")]
    fn nested_entry_names_both_operations() {
        let latch = ProbeLatch::new();
        let _outer = latch.enter("erase");
        let _inner = latch.enter("get");
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn nested_entry_is_allowed_in_release() {
        let latch = ProbeLatch::new();
        let _outer = latch.enter("erase");
        let _inner = latch.enter("get");
    }
}
