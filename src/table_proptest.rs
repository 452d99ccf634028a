#![cfg(all(test, not(loom)))]

// Property tests for both tables, run through the `Table` trait against a
// std HashMap model with an explicit capacity limit.

use crate::hash::{KeyHash, StdHash};
use crate::open_hash_map::OpenHashMap;
use crate::packed_hash_map::PackedHashMap;
use crate::table::{SetOutcome, Table, TableError};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hasher;

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Inherent lookups the `Table` trait does not cover.
trait Sut: Table<Key = Key, Value = i32> {
    fn contains_str(&self, s: &str) -> bool;
    fn value_mut(&mut self, k: &Key) -> Option<&mut i32>;
}

impl<H: KeyHash<Key> + KeyHash<str>> Sut for OpenHashMap<Key, i32, H> {
    fn contains_str(&self, s: &str) -> bool {
        self.contains_key(s)
    }
    fn value_mut(&mut self, k: &Key) -> Option<&mut i32> {
        self.get_mut(k)
    }
}

impl<H: KeyHash<Key> + KeyHash<str>> Sut for PackedHashMap<Key, i32, H> {
    fn contains_str(&self, s: &str) -> bool {
        self.contains_key(s)
    }
    fn value_mut(&mut self, k: &Key) -> Option<&mut i32> {
        self.get_mut(k)
    }
}

// Pool-indexed operations so shrinking moves toward earlier keys.
#[derive(Clone, Debug)]
enum OpI {
    Set(usize, i32, bool),
    Erase(usize),
    Get(usize),
    Contains(String),
    Mutate(usize, i32),
    Assign(Vec<(usize, i32)>),
    Iterate,
    Clear,
    Recreate,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (usize, Vec<String>, Vec<OpI>)> {
    (0usize..=6, proptest::collection::vec("[a-z]{0,5}", 1..=8)).prop_flat_map(|(cap, pool)| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>(), any::<bool>()).prop_map(|(i, v, o)| OpI::Set(i, v, o)),
            2 => idx.clone().prop_map(OpI::Erase),
            2 => idx.clone().prop_map(OpI::Get),
            1 => prop_oneof![
                contains_pool.prop_map(|s: String| s),
                "[a-z]{0,5}".prop_map(|s| s)
            ]
            .prop_map(OpI::Contains),
            1 => (idx.clone(), any::<i32>()).prop_map(|(i, d)| OpI::Mutate(i, d)),
            1 => proptest::collection::vec((idx.clone(), any::<i32>()), 0..10).prop_map(OpI::Assign),
            1 => Just(OpI::Iterate),
            1 => Just(OpI::Clear),
            1 => Just(OpI::Recreate),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (cap, pool.clone(), ops))
    })
}

fn expected_set(
    model: &mut HashMap<Key, i32>,
    capacity: usize,
    k: Key,
    v: i32,
    overwrite: bool,
) -> Result<SetOutcome, TableError> {
    let len = model.len();
    match model.get_mut(&k) {
        Some(_) if !overwrite => Ok(SetOutcome::Exists),
        Some(slot) => {
            *slot = v;
            Ok(SetOutcome::Overwritten)
        }
        None if len < capacity => {
            model.insert(k, v);
            Ok(SetOutcome::Inserted)
        }
        None => Err(TableError::Full { capacity }),
    }
}

// Invariants exercised across random operation sequences:
// - `set` outcomes match the model, including `Full` exactly at capacity.
// - `erase` returns the owned pair the model held; re-insert is `Inserted`.
// - `get`/`contains_key` parity, borrowed lookup through `&str`.
// - `assign` clears, keeps the last duplicate, stops at the first `Full`.
// - `iter` yields each live entry once; `len <= capacity` always.
fn check_state_machine<T: Sut>(
    sut: &mut T,
    capacity: usize,
    pool: &[String],
    ops: Vec<OpI>,
) -> Result<(), TestCaseError> {
    sut.create(capacity).unwrap();
    let mut model: HashMap<Key, i32> = HashMap::new();

    for op in ops {
        match op {
            OpI::Set(i, v, overwrite) => {
                let k = key_from(pool, i);
                let got = sut.set(k.clone(), v, overwrite);
                let want = expected_set(&mut model, capacity, k, v, overwrite);
                prop_assert_eq!(got, want);
            }
            OpI::Erase(i) => {
                let k = key_from(pool, i);
                let want = model.remove(&k).map(|v| (k.clone(), v));
                prop_assert_eq!(sut.erase(&k), want);
                prop_assert!(sut.get(&k).is_none());
            }
            OpI::Get(i) => {
                let k = key_from(pool, i);
                prop_assert_eq!(sut.get(&k), model.get(&k));
            }
            OpI::Contains(s) => {
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(sut.contains_str(&s), has_model);
            }
            OpI::Mutate(i, d) => {
                let k = key_from(pool, i);
                match (sut.value_mut(&k), model.get_mut(&k)) {
                    (Some(sv), Some(mv)) => {
                        *sv = sv.saturating_add(d);
                        *mv = mv.saturating_add(d);
                    }
                    (None, None) => {}
                    (s, m) => prop_assert!(false, "presence mismatch: {:?} vs {:?}", s, m),
                }
            }
            OpI::Assign(pairs) => {
                model.clear();
                let mut want = Ok(());
                for &(i, v) in &pairs {
                    if let Err(e) = expected_set(&mut model, capacity, key_from(pool, i), v, true) {
                        want = Err(e);
                        break;
                    }
                }
                let got = sut.assign(pairs.into_iter().map(|(i, v)| (key_from(pool, i), v)));
                prop_assert_eq!(got, want);
            }
            OpI::Iterate => {
                let seen: BTreeMap<_, _> = sut.iter().map(|(k, v)| (k.clone(), *v)).collect();
                let want: BTreeMap<_, _> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(sut.iter().count(), sut.len());
                prop_assert_eq!(seen, want);
            }
            OpI::Clear => {
                sut.clear();
                model.clear();
                prop_assert_eq!(sut.capacity(), capacity);
            }
            OpI::Recreate => {
                sut.create(capacity).unwrap();
                model.clear();
            }
        }

        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        prop_assert!(sut.len() <= sut.capacity());
    }

    sut.destroy();
    prop_assert_eq!(sut.len(), 0);
    prop_assert_eq!(sut.capacity(), 0);
    Ok(())
}

// Constant hasher: every key collides, so equality alone resolves lookups.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl std::hash::BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_open_state_machine((cap, pool, ops) in arb_scenario()) {
        let mut sut: OpenHashMap<Key, i32> = OpenHashMap::new();
        check_state_machine(&mut sut, cap, &pool, ops)?;
    }

    #[test]
    fn prop_open_state_machine_with_collisions((cap, pool, ops) in arb_scenario()) {
        let mut sut: OpenHashMap<Key, i32, StdHash<ConstBuildHasher>> =
            OpenHashMap::with_hasher(StdHash(ConstBuildHasher));
        check_state_machine(&mut sut, cap, &pool, ops)?;
    }

    #[test]
    fn prop_packed_state_machine((cap, pool, ops) in arb_scenario()) {
        let mut sut: PackedHashMap<Key, i32> = PackedHashMap::new();
        check_state_machine(&mut sut, cap, &pool, ops)?;
    }

    #[test]
    fn prop_packed_state_machine_with_collisions((cap, pool, ops) in arb_scenario()) {
        let mut sut: PackedHashMap<Key, i32, StdHash<ConstBuildHasher>> =
            PackedHashMap::with_hasher(StdHash(ConstBuildHasher));
        check_state_machine(&mut sut, cap, &pool, ops)?;
    }
}
