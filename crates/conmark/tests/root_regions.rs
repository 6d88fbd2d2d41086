//! Root-region scanning through the coordinator.

use std::thread;

use conmark::{ConcurrentMark, MarkConfig, MarkError, MarkPhase, MemRegion, ModelHeap};

#[test]
fn test_root_region_referents_are_marked_before_marking() {
    let heap = ModelHeap::new(4, 4096);
    let old_a = heap.alloc(0, 2, &[]);
    let old_b = heap.alloc(0, 2, &[]);
    let old_c = heap.alloc(1, 2, &[]);
    heap.snapshot_tams();
    // Survivors copied during the start pause: above TAMS, referencing old
    // objects.
    heap.alloc(2, 3, &[old_a]);
    heap.alloc(3, 3, &[old_c]);

    let cm = ConcurrentMark::new(heap, MarkConfig::new(2)).unwrap();
    cm.concurrent_cycle_start().unwrap();
    cm.add_root_region(cm.heap().used_region(2)).unwrap();
    cm.add_root_region(cm.heap().used_region(3)).unwrap();
    assert_eq!(cm.root_regions().num_root_regions(), 2);

    cm.scan_root_regions().unwrap();
    assert_eq!(cm.phase(), MarkPhase::ConcurrentMark);
    assert!(cm.is_marked(old_a));
    assert!(cm.is_marked(old_c));
    assert!(!cm.is_marked(old_b));
    assert!(!cm.root_regions().scan_in_progress());
    assert_eq!(cm.root_regions().num_root_regions(), 0);
}

#[test]
fn test_many_root_regions_scanned_in_parallel() {
    let heap = ModelHeap::new(32, 4096);
    let targets: Vec<_> = (0..16).map(|i| heap.alloc(i, 1, &[])).collect();
    heap.snapshot_tams();
    for (i, &target) in targets.iter().enumerate() {
        heap.alloc(16 + i, 2, &[target]);
    }

    let cm = ConcurrentMark::new(heap, MarkConfig::new(4)).unwrap();
    cm.concurrent_cycle_start().unwrap();
    for i in 16..32 {
        cm.add_root_region(cm.heap().used_region(i)).unwrap();
    }
    cm.scan_root_regions().unwrap();
    assert!(targets.iter().all(|&t| cm.is_marked(t)));

    cm.mark_from_roots().unwrap();
    cm.preclean().unwrap();
    cm.remark().unwrap();
    let empty = cm.cleanup().unwrap();
    cm.concurrent_cycle_end().unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_waiters_are_released_when_scan_finishes() {
    let heap = ModelHeap::new(8, 4096);
    let targets: Vec<_> = (0..4).map(|i| heap.alloc(i, 1, &[])).collect();
    heap.snapshot_tams();
    for (i, &target) in targets.iter().enumerate() {
        heap.alloc(4 + i, 2, &[target]);
    }

    let cm = ConcurrentMark::new(heap, MarkConfig::new(2)).unwrap();
    cm.concurrent_cycle_start().unwrap();
    for i in 4..8 {
        cm.add_root_region(cm.heap().used_region(i)).unwrap();
    }

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            cm.wait_until_root_region_scan_finished();
            cm.root_regions().scan_in_progress()
        });
        cm.scan_root_regions().unwrap();
        assert!(!waiter.join().unwrap());
    });
    assert!(targets.iter().all(|&t| cm.is_marked(t)));
}

#[test]
fn test_aborted_scan_reports_cycle_aborted() {
    let heap = ModelHeap::new(4, 4096);
    let old = heap.alloc(0, 1, &[]);
    heap.snapshot_tams();
    heap.alloc(1, 2, &[old]);

    let cm = ConcurrentMark::new(heap, MarkConfig::new(2)).unwrap();
    cm.concurrent_cycle_start().unwrap();
    cm.add_root_region(cm.heap().used_region(1)).unwrap();
    cm.abort_marking_threads();

    assert!(matches!(cm.scan_root_regions(), Err(MarkError::CycleAborted)));
    assert!(!cm.root_regions().scan_in_progress());
    assert!(!cm.wait_until_root_region_scan_finished());
    assert!(cm.concurrent_cycle_abort());
    assert_eq!(cm.phase(), MarkPhase::Idle);
}

#[test]
fn test_add_root_region_checks_phase_and_capacity() {
    let heap = ModelHeap::new(2, 4096);
    heap.snapshot_tams();
    let cm = ConcurrentMark::new(heap, MarkConfig::new(1)).unwrap();
    let region = MemRegion::new(4096, 4096 + 64);

    assert!(matches!(
        cm.add_root_region(region),
        Err(MarkError::InvalidPhase {
            expected: MarkPhase::ScanRootRegions,
            actual: MarkPhase::Idle,
        })
    ));

    cm.concurrent_cycle_start().unwrap();
    cm.add_root_region(region).unwrap();
    cm.add_root_region(MemRegion::new(8192, 8192 + 64)).unwrap();
    assert!(matches!(
        cm.add_root_region(region),
        Err(MarkError::InvalidConfig(_))
    ));
    assert!(cm.root_regions().contains(region));
}
