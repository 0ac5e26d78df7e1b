use num_cpus;
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use xarray_core::{AllocMode, Entry, Error, Filter, XArray, XArrayConfig, XaState};

#[derive(Debug, Clone)]
enum Op {
    Store(usize, usize),
    Erase(usize),
    StoreRange(usize, u32, usize),
    EraseRange(usize, u32),
    Tag(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let index = prop_oneof![
        4 => 0usize..600,
        1 => Just(usize::MAX),
        1 => (0usize..64).prop_map(|i| (1usize << 40) + i),
    ];
    prop_oneof![
        4 => (index.clone(), 0usize..1000).prop_map(|(i, v)| Op::Store(i, v)),
        2 => index.clone().prop_map(Op::Erase),
        2 => (0usize..600, 0u32..8, 0usize..1000).prop_map(|(i, o, v)| Op::StoreRange(i, o, v)),
        1 => (0usize..600, 0u32..8).prop_map(|(i, o)| Op::EraseRange(i, o)),
        1 => index.prop_map(Op::Tag),
    ]
}

/// Apply `ops` to both the array and a per-index model.
fn run_model(xa: &XArray<()>, ops: &[Op]) -> (BTreeMap<usize, usize>, BTreeMap<usize, bool>) {
    let mut model = BTreeMap::new();
    let mut tags = BTreeMap::new();
    for op in ops {
        match *op {
            Op::Store(i, v) => {
                let old = xa.store(i, Some(Entry::Value(v))).unwrap();
                assert_eq!(old.and_then(|e| e.as_value()), model.get(&i).copied());
                model.insert(i, v);
            }
            Op::Erase(i) => {
                let old = xa.erase(i).unwrap();
                assert_eq!(old.and_then(|e| e.as_value()), model.remove(&i));
                tags.remove(&i);
            }
            Op::StoreRange(i, o, v) => {
                xa.store_range(i, o, Some(Entry::Value(v))).unwrap();
                let first = i & !((1usize << o) - 1);
                for j in first..first + (1usize << o) {
                    model.insert(j, v);
                }
            }
            Op::EraseRange(i, o) => {
                xa.store_range(i, o, None).unwrap();
                let first = i & !((1usize << o) - 1);
                for j in first..first + (1usize << o) {
                    model.remove(&j);
                    tags.remove(&j);
                }
            }
            Op::Tag(i) => {
                xa.set_tag(i, 0);
                if model.contains_key(&i) {
                    tags.insert(i, true);
                }
            }
        }
    }
    (model, tags)
}

/// Store through the writer lock, refilling the reserve after each
/// allocation failure. A failed attempt must leave the tree as it was.
fn store_with_reserve(xa: &XArray<()>, mut xas: XaState, entry: Option<Entry<()>>) -> Option<Entry<()>> {
    loop {
        let before = xa.dump();
        let lock = xa.lock();
        let old = lock.store(&mut xas, entry.clone());
        drop(lock);
        match xas.error() {
            None => return old,
            Some(Error::OutOfMemory) => {
                assert_eq!(xa.dump(), before, "failed store at {:#x} touched the tree", xas.index());
                assert!(xas.nomem());
            }
            Some(err) => panic!("store at {:#x} failed: {err:?}", xas.index()),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn behaves_like_a_map(ops in pvec(op_strategy(), 1..120)) {
        let xa: XArray<()> = XArray::new();
        let (model, _) = run_model(&xa, &ops);

        for i in 0..700usize {
            prop_assert_eq!(xa.load(i).and_then(|e| e.as_value()), model.get(&i).copied(), "index {}", i);
        }
        for (&i, &v) in &model {
            prop_assert_eq!(xa.load(i), Some(Entry::Value(v)));
            let mut at = i;
            prop_assert_eq!(xa.find(&mut at, usize::MAX, Filter::Present), Some(Entry::Value(v)));
            prop_assert_eq!(at, i);
        }
        prop_assert_eq!(xa.is_empty(), model.is_empty());

        // Iteration visits entries in order and never reports an empty index.
        let mut last = None;
        for (i, e) in xa.iter(0, usize::MAX) {
            prop_assert_eq!(Some(&e.as_value().unwrap()), model.get(&i));
            prop_assert!(last.map_or(true, |l| l < i));
            last = Some(i);
        }

        // Emptying everything leaves nothing behind.
        for &i in model.keys() {
            xa.erase(i).unwrap();
        }
        prop_assert!(xa.is_empty());
    }

    #[test]
    fn tags_track_the_model(ops in pvec(op_strategy(), 1..80)) {
        let xa: XArray<()> = XArray::new();
        let (model, tags) = run_model(&xa, &ops);
        // Tags set on a present index survive overwrites and range splits;
        // anything erased lost its tag.
        for &i in tags.keys() {
            if model.contains_key(&i) {
                prop_assert!(xa.get_tag(i, 0), "index {} lost its tag", i);
            }
        }
        for i in 0..700usize {
            if !model.contains_key(&i) {
                prop_assert!(!xa.get_tag(i, 0), "empty index {} is tagged", i);
            }
        }
        let tagged: Vec<usize> = xa.iter_tagged(0, usize::MAX, 0).map(|(i, _)| i).collect();
        prop_assert_eq!(xa.is_tagged(0), !tagged.is_empty());
    }

    #[test]
    fn small_fanout_matches_the_default(ops in pvec(op_strategy(), 1..80)) {
        let wide: XArray<()> = XArray::new();
        let narrow: XArray<()> =
            XArray::with_config(XArrayConfig::new().chunk_shift(3)).unwrap();
        run_model(&wide, &ops);
        run_model(&narrow, &ops);
        let a: Vec<_> = wide.iter(0, usize::MAX).collect();
        let b: Vec<_> = narrow.iter(0, usize::MAX).collect();
        prop_assert_eq!(a.len(), b.len());
        for i in 0..700usize {
            prop_assert_eq!(wide.load(i), narrow.load(i));
        }
    }

    #[test]
    fn deferred_failures_leave_tree_untouched(ops in pvec(op_strategy(), 1..60)) {
        let cfg = XArrayConfig::new().alloc_mode(AllocMode::Deferred);
        let xa: XArray<()> = XArray::with_config(cfg).unwrap();
        let mut model = BTreeMap::new();
        for op in &ops {
            match *op {
                Op::Store(i, v) => {
                    let old = store_with_reserve(&xa, XaState::new(i), Some(Entry::Value(v)));
                    prop_assert_eq!(old.and_then(|e| e.as_value()), model.insert(i, v));
                }
                Op::Erase(i) => {
                    let old = store_with_reserve(&xa, XaState::new(i), None);
                    prop_assert_eq!(old.and_then(|e| e.as_value()), model.remove(&i));
                }
                Op::StoreRange(i, o, v) => {
                    let xas = XaState::with_order(i, o).unwrap();
                    store_with_reserve(&xa, xas, Some(Entry::Value(v)));
                    let first = i & !((1usize << o) - 1);
                    for j in first..first + (1usize << o) {
                        model.insert(j, v);
                    }
                }
                Op::EraseRange(i, o) => {
                    let xas = XaState::with_order(i, o).unwrap();
                    store_with_reserve(&xa, xas, None);
                    let first = i & !((1usize << o) - 1);
                    for j in first..first + (1usize << o) {
                        model.remove(&j);
                    }
                }
                Op::Tag(i) => xa.set_tag(i, 0),
            }
        }
        for i in 0..700usize {
            prop_assert_eq!(xa.load(i).and_then(|e| e.as_value()), model.get(&i).copied(), "index {}", i);
        }
        for (&i, &v) in &model {
            prop_assert_eq!(xa.load(i), Some(Entry::Value(v)));
        }
    }
}

/// One writer churns values while readers check they only ever see an
/// index's own value or nothing.
#[test]
fn readers_never_see_foreign_values() {
    let readers = num_cpus::get().clamp(2, 8);
    const SPAN: usize = 4096;
    const ROUNDS: usize = 20;

    let xa: Arc<XArray<()>> = Arc::new(XArray::new());
    let barrier = Arc::new(Barrier::new(readers + 1));
    let done = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..readers {
        let xa = Arc::clone(&xa);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            barrier.wait();
            while !done.load(Ordering::Acquire) {
                let i = rng.random_range(0..SPAN);
                if let Some(e) = xa.load(i) {
                    assert_eq!(e, Entry::Value(i));
                }
                let mut prev = None;
                for (j, e) in xa.iter(i, i + 256) {
                    assert_eq!(e, Entry::Value(j));
                    assert!(prev.map_or(true, |p| p < j));
                    prev = Some(j);
                }
            }
        }));
    }

    barrier.wait();
    let mut rng = rand::rng();
    for _ in 0..ROUNDS {
        for i in 0..SPAN {
            xa.store(i, Some(Entry::Value(i))).unwrap();
        }
        for _ in 0..SPAN {
            let i = rng.random_range(0..SPAN);
            xa.erase(i).unwrap();
        }
        for i in 0..SPAN {
            xa.erase(i).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    for h in handles {
        h.join().expect("reader panicked");
    }
    assert!(xa.is_empty());
}

/// Pointer entries stay dereferenceable while a writer replaces them and
/// tears nodes down underneath concurrent readers.
#[test]
fn pointers_survive_concurrent_replacement() {
    let readers = num_cpus::get().clamp(2, 8);
    const SPAN: usize = 1024;
    const ROUNDS: usize = 30;

    let xa: Arc<XArray<u64>> = Arc::new(XArray::new());
    let barrier = Arc::new(Barrier::new(readers + 1));
    let done = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..readers {
        let xa = Arc::clone(&xa);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            barrier.wait();
            while !done.load(Ordering::Acquire) {
                let i = rng.random_range(0..SPAN);
                let read = xa.read();
                if let Some(Entry::Pointer(p)) = read.load(i) {
                    assert_eq!(*p, i as u64);
                }
                let mut at = i;
                if let Some(Entry::Pointer(p)) = read.find(&mut at, usize::MAX, Filter::Present) {
                    assert_eq!(*p, at as u64);
                }
            }
        }));
    }

    barrier.wait();
    for round in 0..ROUNDS {
        for i in 0..SPAN {
            xa.store(i, Some(Entry::Pointer(Arc::new(i as u64)))).unwrap();
        }
        // Collapse whole leaves into multi-index entries and back.
        if round % 3 == 0 {
            for base in (0..SPAN).step_by(64) {
                xa.store_range(base, 6, None).unwrap();
            }
        }
        for i in (0..SPAN).rev() {
            xa.erase(i).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    for h in handles {
        h.join().expect("reader panicked");
    }
    assert!(xa.is_empty());
}

/// Readers iterate bounded windows while a writer keeps storing
/// multi-index entries and splitting them with smaller stores.
#[test]
fn iteration_stays_ordered_while_entries_split() {
    let readers = num_cpus::get().clamp(2, 8);
    const SPAN: usize = 2048;
    const WINDOW: usize = 300;
    const ROUNDS: usize = 40;
    const ORDERS: [u32; 6] = [0, 1, 2, 6, 7, 8];

    let xa: Arc<XArray<()>> = Arc::new(XArray::new());
    let barrier = Arc::new(Barrier::new(readers + 1));
    let done = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..readers {
        let xa = Arc::clone(&xa);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            barrier.wait();
            while !done.load(Ordering::Acquire) {
                let first = rng.random_range(0..SPAN);
                let last = first + WINDOW;
                let mut prev = None;
                for (j, e) in xa.iter(first, last) {
                    assert!((first..=last).contains(&j), "{j} outside {first}..={last}");
                    assert!(prev.map_or(true, |p| p < j), "went back from {prev:?} to {j}");
                    assert!(e.is_value());
                    prev = Some(j);
                }
                let mut prev = None;
                for (j, _) in xa.iter_tagged(first, last, 0) {
                    assert!((first..=last).contains(&j));
                    assert!(prev.map_or(true, |p| p < j));
                    prev = Some(j);
                }
            }
        }));
    }

    barrier.wait();
    let mut rng = rand::rng();
    for round in 0..ROUNDS {
        for (k, base) in (0..SPAN).step_by(256).enumerate() {
            let order = ORDERS[(round + k) % ORDERS.len()];
            let at = base + rng.random_range(0..256);
            xa.store_range(at, order, Some(Entry::Value(round))).unwrap();
            xa.set_tag(at, 0);
        }
        for _ in 0..512 {
            let i = rng.random_range(0..SPAN);
            if rng.random_range(0..4) == 0 {
                xa.erase(i).unwrap();
            } else {
                xa.store(i, Some(Entry::Value(i))).unwrap();
            }
        }
    }
    done.store(true, Ordering::Release);
    for h in handles {
        h.join().expect("reader panicked");
    }
}
