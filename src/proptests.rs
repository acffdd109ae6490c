use super::*;

use proptest::prelude::*;
use std::collections::HashMap;

/// Reference model: value plus the live flag, mirroring slot state.
/// Removing an entry from the model entirely corresponds to compaction.
type Model = HashMap<u16, (u64, bool)>;

#[derive(Clone, Debug)]
enum Op {
    Set(u16, u64),
    Insert(u16, u64),
    Remove(u16),
    Get(u16),
    GetOld(u16),
    Compact,
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
    // A small key space keeps collisions, resurrections, and tombstone hits
    // frequent.
    let key = 0u16..64;
    let op = prop_oneof![
        30 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Set(k, v)),
        15 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        25 => key.clone().prop_map(Op::Remove),
        15 => key.clone().prop_map(Op::Get),
        10 => key.clone().prop_map(Op::GetOld),
        4 => Just(Op::Compact),
        1 => Just(Op::Clear),
    ];
    prop::collection::vec(op, 0..=1500)
}

fn model_live_count(model: &Model) -> usize {
    model.values().filter(|(_, used)| *used).count()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 50_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_matches_model_map(ops in op_strategy()) {
        let mut map: ReuseMap<u16, u64> = ReuseMap::new();
        let mut model: Model = HashMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    map.set(k, v).unwrap();
                    model.insert(k, (v, true));
                }
                Op::Insert(k, v) => {
                    let got = map.insert(k, v);
                    match model.get(&k) {
                        Some((_, true)) => prop_assert_eq!(got, Err(Error::DuplicateKey)),
                        _ => {
                            prop_assert_eq!(got, Ok(()));
                            model.insert(k, (v, true));
                        }
                    }
                }
                Op::Remove(k) => {
                    let removed = map.remove(&k);
                    let model_removed = match model.get_mut(&k) {
                        Some(entry) if entry.1 => {
                            entry.1 = false;
                            true
                        }
                        _ => false,
                    };
                    prop_assert_eq!(removed, model_removed);
                }
                Op::Get(k) => {
                    let want = match model.get(&k) {
                        Some(&(v, true)) => Some(v),
                        _ => None,
                    };
                    prop_assert_eq!(map.try_get(&k).copied(), want);
                    prop_assert_eq!(map.contains_key(&k), want.is_some());
                    match want {
                        Some(v) => prop_assert_eq!(map.get(&k), Ok(&v)),
                        None => prop_assert_eq!(map.get(&k), Err(Error::KeyNotFound)),
                    }
                }
                Op::GetOld(k) => {
                    let want = match model.get(&k) {
                        Some(&(v, false)) => Some(v),
                        _ => None,
                    };
                    prop_assert_eq!(map.try_get_old(&k).copied(), want);
                    prop_assert_eq!(map.contains_old_key(&k), want.is_some());
                }
                Op::Compact => {
                    map.compact();
                    model.retain(|_, (_, used)| *used);
                }
                Op::Clear => {
                    map.clear();
                    for entry in model.values_mut() {
                        entry.1 = false;
                    }
                }
            }

            prop_assert_eq!(map.len(), model_live_count(&model));
            map.check_invariants();
        }

        // Final sweep: every model entry is visible through the right read
        // path, and iteration yields exactly the live population.
        for (&k, &(v, used)) in &model {
            if used {
                prop_assert_eq!(map.try_get(&k), Some(&v));
            } else {
                prop_assert_eq!(map.try_get_old(&k), Some(&v));
            }
        }
        let mut seen: Vec<(u16, u64)> = map.iter().map(|(&k, &v)| (k, v)).collect();
        seen.sort_unstable();
        let mut want: Vec<(u16, u64)> = model
            .iter()
            .filter(|(_, (_, used))| *used)
            .map(|(&k, &(v, _))| (k, v))
            .collect();
        want.sort_unstable();
        prop_assert_eq!(seen, want);
    }

    #[test]
    fn prop_growth_preserves_population(extra in 1usize..512, removed in 0usize..64) {
        // Fill a small table, tombstone part of it, then force growth and
        // check both populations survived with their flags intact.
        let mut map: ReuseMap<u32, u64> = ReuseMap::with_capacity(64);
        for i in 0..64u32 {
            map.insert(i, u64::from(i) << 8).unwrap();
        }
        for i in 0..removed as u32 {
            map.remove(&i);
        }

        for i in 0..extra as u32 {
            map.insert(1000 + i, u64::from(i)).unwrap();
        }
        map.check_invariants();

        for i in 0..64u32 {
            let want = u64::from(i) << 8;
            if (i as usize) < removed {
                prop_assert_eq!(map.try_get_old(&i), Some(&want));
            } else {
                prop_assert_eq!(map.try_get(&i), Some(&want));
            }
        }
        for i in 0..extra as u32 {
            prop_assert_eq!(map.try_get(&(1000 + i)), Some(&u64::from(i)));
        }
    }
}
