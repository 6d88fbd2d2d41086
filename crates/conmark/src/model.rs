//! An in-memory [`MarkHeap`].
//!
//! `ModelHeap` hands out addresses from a synthetic, region-aligned address
//! range and keeps the object graph in ordinary collections. It backs the
//! crate's tests, benches and docs, and is a reference for implementing
//! [`MarkHeap`] over a real heap.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::ops::Range;

use parking_lot::RwLock;

use crate::entry::{ObjRef, WORD_SIZE};
use crate::heap::{MarkHeap, RegionIdx};
use crate::root_regions::MemRegion;

/// Words in front of the elements of a reference array.
pub const ARRAY_HEADER_WORDS: usize = 2;

#[derive(Debug, Clone)]
enum Shape {
    Plain(Vec<ObjRef>),
    Array(Vec<Option<ObjRef>>),
}

#[derive(Debug, Clone)]
struct ModelObject {
    size_words: usize,
    shape: Shape,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<usize, ModelObject>,
    tops: Vec<usize>,
    tams: Vec<usize>,
    soft_referents: Vec<ObjRef>,
    finalizable: Vec<ObjRef>,
    pending_finalization: Vec<ObjRef>,
}

/// A heap of `num_regions` regions of `region_size` bytes each.
///
/// # Example
///
/// ```
/// use conmark::ModelHeap;
///
/// let heap = ModelHeap::new(4, 4096);
/// let leaf = heap.alloc(0, 2, &[]);
/// let root = heap.alloc(1, 3, &[leaf]);
/// assert_eq!(heap.references(root), vec![leaf]);
/// ```
#[derive(Debug)]
pub struct ModelHeap {
    base: usize,
    region_size: usize,
    num_regions: usize,
    state: RwLock<State>,
}

impl ModelHeap {
    /// Create an empty heap. All TAMS start at region bottom.
    ///
    /// # Panics
    ///
    /// Panics if `region_size` is not a power of two of at least a few words,
    /// or `num_regions` is zero.
    #[must_use]
    pub fn new(num_regions: usize, region_size: usize) -> Self {
        assert!(num_regions > 0, "ModelHeap needs at least one region");
        assert!(
            region_size.is_power_of_two() && region_size >= 8 * WORD_SIZE,
            "region size must be a power of two of at least 8 words"
        );
        let base = region_size;
        let bottoms: Vec<usize> = (0..num_regions).map(|i| base + i * region_size).collect();
        Self {
            base,
            region_size,
            num_regions,
            state: RwLock::new(State {
                objects: BTreeMap::new(),
                tops: bottoms.clone(),
                tams: bottoms,
                soft_referents: Vec::new(),
                finalizable: Vec::new(),
                pending_finalization: Vec::new(),
            }),
        }
    }

    fn bottom(&self, region: usize) -> usize {
        self.base + region * self.region_size
    }

    fn bump(&self, state: &mut State, region: usize, size_words: usize) -> Option<usize> {
        assert!(region < self.num_regions, "region {region} out of range");
        let addr = state.tops[region];
        let end = addr.checked_add(size_words * WORD_SIZE)?;
        if end > self.bottom(region) + self.region_size {
            return None;
        }
        state.tops[region] = end;
        Some(addr)
    }

    /// Allocate a plain object of `size_words` words (at least one) holding
    /// `refs` in region `region`. Returns `None` if the region is full.
    pub fn try_alloc(&self, region: usize, size_words: usize, refs: &[ObjRef]) -> Option<ObjRef> {
        let size_words = size_words.max(1);
        let mut state = self.state.write();
        let addr = self.bump(&mut state, region, size_words)?;
        state.objects.insert(
            addr,
            ModelObject {
                size_words,
                shape: Shape::Plain(refs.to_vec()),
            },
        );
        ObjRef::new(addr)
    }

    /// Like [`try_alloc`](Self::try_alloc).
    ///
    /// # Panics
    ///
    /// Panics if the region is full.
    pub fn alloc(&self, region: usize, size_words: usize, refs: &[ObjRef]) -> ObjRef {
        match self.try_alloc(region, size_words, refs) {
            Some(obj) => obj,
            None => panic!("region {region} is full"),
        }
    }

    /// Allocate a reference array. `None` elements are null.
    ///
    /// # Panics
    ///
    /// Panics if the region is full.
    pub fn alloc_array(&self, region: usize, elements: &[Option<ObjRef>]) -> ObjRef {
        let size_words = ARRAY_HEADER_WORDS + elements.len();
        let mut state = self.state.write();
        let Some(addr) = self.bump(&mut state, region, size_words) else {
            panic!("region {region} is full");
        };
        state.objects.insert(
            addr,
            ModelObject {
                size_words,
                shape: Shape::Array(elements.to_vec()),
            },
        );
        match ObjRef::new(addr) {
            Some(obj) => obj,
            None => unreachable!("heap addresses are never zero"),
        }
    }

    /// Overwrite the fields of a plain object, as a mutator store would.
    pub fn set_refs(&self, obj: ObjRef, refs: &[ObjRef]) {
        let mut state = self.state.write();
        if let Some(ModelObject {
            shape: Shape::Plain(fields),
            ..
        }) = state.objects.get_mut(&obj.addr())
        {
            *fields = refs.to_vec();
        }
    }

    /// Overwrite one element of an array.
    pub fn set_element(&self, array: ObjRef, index: usize, value: Option<ObjRef>) {
        let mut state = self.state.write();
        if let Some(ModelObject {
            shape: Shape::Array(elements),
            ..
        }) = state.objects.get_mut(&array.addr())
        {
            elements[index] = value;
        }
    }

    /// Set every region's TAMS to its current top, as at cycle start.
    pub fn snapshot_tams(&self) {
        let mut state = self.state.write();
        state.tams = state.tops.clone();
    }

    /// Span of region `region` below its top.
    #[must_use]
    pub fn used_region(&self, region: usize) -> MemRegion {
        let state = self.state.read();
        MemRegion::new(self.bottom(region), state.tops[region])
    }

    /// Every allocated object, in address order.
    #[must_use]
    pub fn objects(&self) -> Vec<ObjRef> {
        self.state
            .read()
            .objects
            .keys()
            .filter_map(|&a| ObjRef::new(a))
            .collect()
    }

    /// Plain fields, or non-null elements, of `obj`.
    #[must_use]
    pub fn references(&self, obj: ObjRef) -> Vec<ObjRef> {
        let state = self.state.read();
        match state.objects.get(&obj.addr()).map(|o| &o.shape) {
            Some(Shape::Plain(refs)) => refs.clone(),
            Some(Shape::Array(elements)) => elements.iter().flatten().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Everything transitively reachable from `roots`, roots included.
    #[must_use]
    pub fn reachable_from(&self, roots: &[ObjRef]) -> BTreeSet<ObjRef> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ObjRef> = roots.to_vec();
        while let Some(obj) = stack.pop() {
            if seen.insert(obj) {
                stack.extend(self.references(obj));
            }
        }
        seen
    }

    /// Register a referent that reference precleaning keeps alive.
    pub fn add_soft_referent(&self, referent: ObjRef) {
        self.state.write().soft_referents.push(referent);
    }

    /// Register an object to be resurrected and queued for finalization if
    /// marking finds it dead.
    pub fn register_finalizable(&self, obj: ObjRef) {
        self.state.write().finalizable.push(obj);
    }

    /// Objects resurrected by the last reference processing.
    #[must_use]
    pub fn pending_finalization(&self) -> Vec<ObjRef> {
        self.state.read().pending_finalization.clone()
    }
}

impl MarkHeap for ModelHeap {
    fn reserved(&self) -> MemRegion {
        MemRegion::new(self.base, self.base + self.num_regions * self.region_size)
    }

    fn region_size(&self) -> usize {
        self.region_size
    }

    fn num_regions(&self) -> usize {
        self.num_regions
    }

    fn top_at_mark_start(&self, idx: RegionIdx) -> usize {
        self.state.read().tams[idx.index()]
    }

    fn region_top(&self, idx: RegionIdx) -> usize {
        self.state.read().tops[idx.index()]
    }

    fn object_size(&self, obj: ObjRef) -> usize {
        self.state
            .read()
            .objects
            .get(&obj.addr())
            .map_or(1, |o| o.size_words)
    }

    fn for_each_reference(&self, obj: ObjRef, f: &mut impl FnMut(ObjRef)) {
        // Copy out so `f` runs without the lock held.
        let refs = match self.state.read().objects.get(&obj.addr()).map(|o| &o.shape) {
            Some(Shape::Plain(refs)) => refs.clone(),
            _ => return,
        };
        refs.into_iter().for_each(f);
    }

    fn ref_array_len(&self, obj: ObjRef) -> Option<usize> {
        match self.state.read().objects.get(&obj.addr()).map(|o| &o.shape) {
            Some(Shape::Array(elements)) => Some(elements.len()),
            _ => None,
        }
    }

    fn for_each_array_element(
        &self,
        obj: ObjRef,
        range: Range<usize>,
        f: &mut impl FnMut(ObjRef),
    ) {
        let elements: Vec<ObjRef> =
            match self.state.read().objects.get(&obj.addr()).map(|o| &o.shape) {
                Some(Shape::Array(elements)) => {
                    let end = range.end.min(elements.len());
                    let start = range.start.min(end);
                    elements[start..end].iter().flatten().copied().collect()
                }
                _ => return,
            };
        elements.into_iter().for_each(f);
    }

    fn array_element_addr(&self, obj: ObjRef, index: usize) -> NonZeroUsize {
        let addr = obj.addr() + (ARRAY_HEADER_WORDS + index) * WORD_SIZE;
        NonZeroUsize::new(addr).unwrap_or(NonZeroUsize::MIN)
    }

    fn resolve_array_element(&self, addr: usize) -> (ObjRef, usize) {
        let state = self.state.read();
        let start = state
            .objects
            .range(..=addr)
            .next_back()
            .map_or(addr, |(&start, _)| start);
        let index = (addr - start) / WORD_SIZE - ARRAY_HEADER_WORDS;
        match ObjRef::new(start) {
            Some(obj) => (obj, index),
            None => unreachable!("heap addresses are never zero"),
        }
    }

    fn for_each_object(&self, range: MemRegion, f: &mut impl FnMut(ObjRef)) {
        let objs: Vec<ObjRef> = self
            .state
            .read()
            .objects
            .range(range.start()..range.end())
            .filter_map(|(&a, _)| ObjRef::new(a))
            .collect();
        objs.into_iter().for_each(f);
    }

    fn preclean_discovered_references(
        &self,
        keep_alive: &mut impl FnMut(ObjRef),
        should_yield: &impl Fn() -> bool,
    ) {
        let referents = self.state.read().soft_referents.clone();
        for referent in referents {
            if should_yield() {
                return;
            }
            keep_alive(referent);
        }
    }

    fn process_discovered_references(
        &self,
        is_alive: &impl Fn(ObjRef) -> bool,
        keep_alive: &mut impl FnMut(ObjRef),
    ) {
        let (referents, finalizable) = {
            let state = self.state.read();
            (state.soft_referents.clone(), state.finalizable.clone())
        };
        for referent in referents {
            keep_alive(referent);
        }
        let mut pending = Vec::new();
        for obj in finalizable {
            if !is_alive(obj) {
                keep_alive(obj);
                pending.push(obj);
            }
        }
        self.state.write().pending_finalization = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_bumps_within_region() {
        let heap = ModelHeap::new(2, 256);
        let a = heap.alloc(0, 2, &[]);
        let b = heap.alloc(0, 3, &[a]);
        assert_eq!(b.addr(), a.addr() + 2 * WORD_SIZE);
        assert_eq!(heap.region_index(b.addr()), RegionIdx::new(0));
        assert_eq!(heap.object_size(b), 3);
        assert!(heap.try_alloc(0, 64, &[]).is_none());
    }

    #[test]
    fn test_tams_snapshot() {
        let heap = ModelHeap::new(2, 256);
        let bottom = heap.region_bottom(RegionIdx::new(1));
        assert_eq!(heap.top_at_mark_start(RegionIdx::new(1)), bottom);
        heap.alloc(1, 4, &[]);
        heap.snapshot_tams();
        assert_eq!(
            heap.top_at_mark_start(RegionIdx::new(1)),
            bottom + 4 * WORD_SIZE
        );
        heap.alloc(1, 4, &[]);
        assert_eq!(
            heap.top_at_mark_start(RegionIdx::new(1)),
            bottom + 4 * WORD_SIZE
        );
    }

    #[test]
    fn test_array_element_round_trip() {
        let heap = ModelHeap::new(1, 1024);
        let leaf = heap.alloc(0, 1, &[]);
        let array = heap.alloc_array(0, &[Some(leaf), None, Some(leaf)]);
        assert_eq!(heap.ref_array_len(array), Some(3));
        let addr = heap.array_element_addr(array, 2).get();
        assert_eq!(heap.resolve_array_element(addr), (array, 2));

        let mut seen = Vec::new();
        heap.for_each_array_element(array, 1..3, &mut |o| seen.push(o));
        assert_eq!(seen, vec![leaf]);
    }

    #[test]
    fn test_reachable_from() {
        let heap = ModelHeap::new(1, 1024);
        let c = heap.alloc(0, 1, &[]);
        let b = heap.alloc(0, 1, &[c]);
        let a = heap.alloc(0, 1, &[b]);
        let _garbage = heap.alloc(0, 1, &[a]);
        let live = heap.reachable_from(&[a]);
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec![c, b, a]);
    }
}
