//! Loom tests for the chunk lists and the task queue.
//!
//! These check that chunks and entries handed between threads arrive intact
//! under the explored interleavings.

use std::sync::Arc;

use conmark::{MarkStack, ObjRef, TaskEntry, TaskQueue};

fn entry(i: usize) -> TaskEntry {
    TaskEntry::from_obj(ObjRef::new(0x1000 + i * 8).unwrap())
}

/// A chunk pushed by one thread is popped whole by another, or stays on
/// the stack.
#[test]
#[ignore = "loom test - run with cargo test loom_mark_stack --release -- --ignored"]
fn test_push_then_pop_sees_whole_chunk() {
    loom::model(|| {
        let stack = Arc::new(MarkStack::new(2, 2, 2).unwrap());

        let pusher = loom::thread::spawn({
            let stack = Arc::clone(&stack);
            move || stack.par_push_chunk(&[entry(1), entry(2)])
        });
        let popper = loom::thread::spawn({
            let stack = Arc::clone(&stack);
            move || {
                let mut out = [TaskEntry::Null; 2];
                stack.par_pop_chunk(&mut out).then_some(out)
            }
        });

        assert!(pusher.join().unwrap());
        match popper.join().unwrap() {
            Some(out) => assert_eq!(out, [entry(1), entry(2)]),
            None => assert_eq!(stack.size(), 1),
        }
    });
}

/// Two poppers never receive the same chunk.
#[test]
#[ignore = "loom test - run with cargo test loom_mark_stack --release -- --ignored"]
fn test_concurrent_pops_are_exclusive() {
    loom::model(|| {
        let stack = Arc::new(MarkStack::new(2, 2, 1).unwrap());
        assert!(stack.par_push_chunk(&[entry(1)]));
        assert!(stack.par_push_chunk(&[entry(2)]));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let stack = Arc::clone(&stack);
                loom::thread::spawn(move || {
                    let mut out = [TaskEntry::Null; 1];
                    stack.par_pop_chunk(&mut out).then_some(out[0])
                })
            })
            .collect();

        let mut got: Vec<TaskEntry> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        got.sort_by_key(|e| e.obj().map(ObjRef::addr));
        assert_eq!(got, vec![entry(1), entry(2)]);
        assert!(stack.is_empty());
    });
}

/// The owner's pop and a thief's steal never take the same entry.
#[test]
#[ignore = "loom test - run with cargo test loom_mark_stack --release -- --ignored"]
fn test_pop_and_steal_race_on_last_entry() {
    loom::model(|| {
        let queue: Arc<TaskQueue<usize>> = Arc::new(TaskQueue::new(4));
        assert!(queue.push(7));

        let thief = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });
        let popped = queue.pop();
        let stolen = thief.join().unwrap();

        assert_eq!(usize::from(popped.is_some()) + usize::from(stolen.is_some()), 1);
        assert!(queue.is_empty());
    });
}
