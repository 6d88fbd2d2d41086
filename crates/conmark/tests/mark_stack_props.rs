//! Property tests for the global mark stack, its chunk allocator and the
//! mark bitmap.

use std::collections::HashMap;
use std::thread;

use conmark::{ChunkAllocator, MarkBitmap, MarkStack, ObjRef, TaskEntry, WORD_SIZE};
use proptest::prelude::*;

fn entry(i: usize) -> TaskEntry {
    TaskEntry::from_obj(ObjRef::new(0x10_000 + i * WORD_SIZE).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Entries popped from the stack, plus whatever is left on it, are
    /// exactly the entries pushed, under concurrent pushers and poppers.
    #[test]
    fn prop_concurrent_chunks_lose_and_duplicate_nothing(
        chunk_lens in prop::collection::vec(
            prop::collection::vec(1usize..=8, 1..40),
            2..6,
        ),
        pop_every in 1usize..4,
    ) {
        let total: usize = chunk_lens.iter().flatten().count();
        let stack = MarkStack::new(total.next_power_of_two(), total.next_power_of_two(), 8).unwrap();

        let mut next_id = 0;
        let plans: Vec<Vec<Vec<TaskEntry>>> = chunk_lens
            .iter()
            .map(|lens| {
                lens.iter()
                    .map(|&len| {
                        let chunk = (next_id..next_id + len).map(entry).collect();
                        next_id += len;
                        chunk
                    })
                    .collect()
            })
            .collect();

        let popped: Vec<Vec<TaskEntry>> = thread::scope(|s| {
            let handles: Vec<_> = plans
                .iter()
                .map(|plan| {
                    let stack = &stack;
                    s.spawn(move || {
                        let mut out = vec![TaskEntry::Null; 8];
                        let mut popped = Vec::new();
                        for (i, chunk) in plan.iter().enumerate() {
                            assert!(stack.par_push_chunk(chunk));
                            if i % pop_every == 0 && stack.par_pop_chunk(&mut out) {
                                popped.extend(out.iter().copied().take_while(|e| !e.is_null()));
                            }
                        }
                        popped
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut counts: HashMap<TaskEntry, usize> = HashMap::new();
        for e in popped.into_iter().flatten() {
            *counts.entry(e).or_default() += 1;
        }
        let mut out = vec![TaskEntry::Null; 8];
        while stack.par_pop_chunk(&mut out) {
            for e in out.iter().copied().take_while(|e| !e.is_null()) {
                *counts.entry(e).or_default() += 1;
            }
        }

        prop_assert_eq!(counts.len(), next_id);
        prop_assert!(counts.values().all(|&c| c == 1));
        prop_assert!((0..next_id).all(|i| counts.contains_key(&entry(i))));
    }

    /// Capacity only grows, up to the rounded maximum, and never past it.
    #[test]
    fn prop_capacity_is_monotonic(min in 1usize..16, factor in 1usize..8, pushes in 1usize..64) {
        let stack = MarkStack::new(min, min * factor, 2).unwrap();
        let allocator: &ChunkAllocator = stack.allocator();
        prop_assert!(allocator.min_capacity() >= min);
        prop_assert!(allocator.min_capacity().is_power_of_two());

        stack.set_should_grow(true);
        let mut last = stack.capacity_chunks();
        for i in 0..pushes {
            let pushed = stack.par_push_chunk(&[entry(i)]);
            let capacity = stack.capacity_chunks();
            prop_assert!(capacity >= last);
            prop_assert!(capacity <= allocator.max_capacity());
            prop_assert_eq!(pushed, i < allocator.max_capacity());
            last = capacity;
        }
        stack.set_empty();
        prop_assert_eq!(stack.capacity_chunks(), last);
        while allocator.capacity() < allocator.max_capacity() {
            let before = allocator.capacity();
            stack.expand().unwrap();
            prop_assert!(allocator.capacity() > before);
        }
        prop_assert!(stack.expand().is_err());
    }

    /// Marking the same object twice succeeds exactly once.
    #[test]
    fn prop_marking_is_idempotent(offsets in prop::collection::vec(0usize..512, 1..64)) {
        let base = 0x4_0000;
        let bitmap = MarkBitmap::new(base, 512 * WORD_SIZE);
        let mut seen = std::collections::HashSet::new();
        for off in offsets {
            let obj = ObjRef::new(base + off * WORD_SIZE).unwrap();
            prop_assert_eq!(bitmap.par_mark(obj), seen.insert(off));
            prop_assert!(!bitmap.par_mark(obj));
            prop_assert!(bitmap.is_marked(obj));
        }
        prop_assert_eq!(bitmap.count_marked(bitmap.covered()), seen.len());
    }
}
