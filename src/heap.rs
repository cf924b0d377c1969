//! Spanning Heap Module
//!
//! A span allocator that only knows which parts of a buffer are in use. It
//! does not remember individual block sizes; callers release exactly what
//! they allocated. It can plan a compaction of itself as defrag steps.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::defrag::DefragStep;

/// Every block starts and ends on this boundary.
pub const HEAP_ALIGNMENT: u32 = 16;

pub const fn align_size(size: u32) -> u32 {
    (size + HEAP_ALIGNMENT - 1) & !(HEAP_ALIGNMENT - 1)
}

/// Allocated spans over `[0, size)`, kept sorted and coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpanningHeap {
    size: u32,
    allocated: Vec<(u32, u32)>,
}

impl SpanningHeap {
    /// A heap of `size` bytes, all free.
    pub fn new(size: u32) -> Self {
        Self {
            size: align_size(size),
            allocated: Vec::new(),
        }
    }

    /// Best-fit allocation. Returns the offset of the new block.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let size = align_size(size);
        let (start, _) = self
            .free_spans()
            .filter(|(start, end)| end - start >= size)
            .min_by_key(|(start, end)| end - start)?;
        self.insert_span(start, start + size);
        Some(start)
    }

    /// Mark `[offset, offset + size)` allocated. It must lie inside one
    /// free span.
    pub fn allocate_at(&mut self, offset: u32, size: u32) -> bool {
        let end = offset + align_size(size);
        let fits = self
            .free_spans()
            .any(|(start, span_end)| offset >= start && end <= span_end);
        if fits && end > offset {
            self.insert_span(offset, end);
        }
        fits
    }

    /// Mark `[offset, offset + size)` free. It must lie inside one
    /// allocated span.
    pub fn deallocate(&mut self, offset: u32, size: u32) -> bool {
        let end = offset + align_size(size);
        let Some(index) = self
            .allocated
            .iter()
            .position(|&(start, span_end)| offset >= start && end <= span_end)
        else {
            return false;
        };

        let (start, span_end) = self.allocated[index];
        let mut replacement = Vec::with_capacity(2);
        if start < offset {
            replacement.push((start, offset));
        }
        if end < span_end {
            replacement.push((end, span_end));
        }
        self.allocated.splice(index..=index, replacement);
        true
    }

    fn insert_span(&mut self, start: u32, end: u32) {
        let index = self.allocated.partition_point(|&(s, _)| s < start);
        self.allocated.insert(index, (start, end));
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.allocated.len());
        for &(start, end) in &self.allocated {
            match merged.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => merged.push((start, end)),
            }
        }
        self.allocated = merged;
    }

    /// `(start, end)` of every non-empty free span.
    fn free_spans(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let starts = std::iter::once(0).chain(self.allocated.iter().map(|&(_, end)| end));
        let ends = self
            .allocated
            .iter()
            .map(|&(start, _)| start)
            .chain(std::iter::once(self.size));
        starts.zip(ends).filter(|(start, end)| end > start)
    }

    pub fn available_space(&self) -> u32 {
        self.free_spans().map(|(start, end)| end - start).sum()
    }

    pub fn largest_free_block(&self) -> u32 {
        self.free_spans()
            .map(|(start, end)| end - start)
            .max()
            .unwrap_or(0)
    }

    pub fn allocated_space(&self) -> u32 {
        self.allocated.iter().map(|(start, end)| end - start).sum()
    }

    pub fn heap_size(&self) -> u32 {
        self.size
    }

    /// True when nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    /// Grow the heap by an allocated block of `size` bytes at the end.
    /// Returns the offset of that block.
    pub fn append_new_block(&mut self, size: u32) -> u32 {
        let offset = self.size;
        self.size += align_size(size);
        self.insert_span(offset, self.size);
        offset
    }

    /// Span boundaries alternating free and allocated, starting with a
    /// (possibly empty) free span at zero and ending at the heap end.
    pub fn markers(&self) -> Vec<u32> {
        let mut markers = vec![0];
        for &(start, end) in &self.allocated {
            markers.extend([start, end]);
        }
        if markers.last() != Some(&self.size) {
            markers.push(self.size);
        }
        markers
    }

    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.markers().hash(&mut hasher);
        hasher.finish()
    }

    /// Free space that cannot be used for the largest possible allocation.
    pub fn fragmentation_weight(&self) -> u32 {
        self.available_space() - self.largest_free_block()
    }

    /// Plan a compaction into a fresh buffer: allocated spans packed from
    /// offset zero, smallest first. Steps are ordered by source offset.
    pub fn calculate_defrag_steps(&self) -> Vec<DefragStep> {
        let mut blocks = self.allocated.clone();
        blocks.sort_by_key(|(start, end)| end - start);

        let mut position = 0;
        let mut steps: Vec<DefragStep> = blocks
            .into_iter()
            .map(|(start, end)| {
                let step = DefragStep::new(start, end, position);
                position += end - start;
                step
            })
            .collect();
        steps.sort_by_key(|s| s.source_start);
        steps
    }

    /// Rebuild the spans from where `steps` placed every allocated block.
    pub fn perform_defrag(&mut self, steps: &[DefragStep]) {
        self.allocated = steps
            .iter()
            .map(|s| (s.destination, s.destination + align_size(s.len())))
            .collect();
        self.allocated.sort_unstable();
        self.coalesce();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_best_fit() {
        let mut heap = SpanningHeap::new(256);
        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(32).unwrap();
        assert_eq!((a, b, c), (0, 32, 96));
        assert!(heap.deallocate(b, 64));
        // The 64 byte hole is a tighter fit than the 128 bytes at the end
        assert_eq!(heap.allocate(48), Some(32));
        assert_eq!(heap.allocated_space(), 112);
        assert_eq!(heap.available_space(), 144);
        assert_eq!(heap.largest_free_block(), 128);
    }

    #[test]
    fn test_alignment() {
        let mut heap = SpanningHeap::new(100);
        assert_eq!(heap.heap_size(), 112);
        assert_eq!(heap.allocate(1), Some(0));
        assert_eq!(heap.allocate(1), Some(16));
        assert_eq!(heap.allocated_space(), 32);
    }

    #[test]
    fn test_exhaustion() {
        let mut heap = SpanningHeap::new(64);
        assert_eq!(heap.allocate(64), Some(0));
        assert_eq!(heap.allocate(16), None);
        assert_eq!(heap.available_space(), 0);
        assert_eq!(heap.markers(), vec![0, 0, 64]);
        assert!(heap.deallocate(0, 64));
        assert!(heap.is_empty());
        assert_eq!(heap.markers(), vec![0, 64]);
    }

    #[test]
    fn test_partial_release_splits_span() {
        let mut heap = SpanningHeap::new(128);
        heap.allocate(96).unwrap();
        assert!(heap.deallocate(32, 32));
        assert_eq!(heap.markers(), vec![0, 0, 32, 64, 96, 128]);
        assert!(!heap.deallocate(32, 16));
    }

    #[test]
    fn test_allocate_at_and_append() {
        let mut heap = SpanningHeap::new(128);
        assert!(heap.allocate_at(32, 32));
        assert!(!heap.allocate_at(48, 32));
        assert_eq!(heap.largest_free_block(), 64);
        assert_eq!(heap.append_new_block(64), 128);
        assert_eq!(heap.heap_size(), 192);
        assert_eq!(heap.allocated_space(), 96);
    }

    #[test]
    fn test_defrag_packs_blocks() {
        let mut heap = SpanningHeap::new(256);
        let offsets: Vec<u32> = (0..8).map(|_| heap.allocate(32).unwrap()).collect();
        for offset in offsets.iter().step_by(2) {
            assert!(heap.deallocate(*offset, 32));
        }
        assert_eq!(heap.fragmentation_weight(), 96);

        let available = heap.available_space();
        let steps = heap.calculate_defrag_steps();
        assert_eq!(steps.len(), 4);
        assert!(steps.windows(2).all(|w| w[0].source_start < w[1].source_start));

        heap.perform_defrag(&steps);
        assert_eq!(heap.available_space(), available);
        assert_eq!(heap.largest_free_block(), available);
        assert_eq!(heap.fragmentation_weight(), 0);
        assert_eq!(heap.markers(), vec![0, 0, 128, 256]);
    }

    #[test]
    fn test_hash_tracks_layout() {
        let mut a = SpanningHeap::new(128);
        let b = a.clone();
        assert_eq!(a.hash(), b.hash());
        a.allocate(16);
        assert_ne!(a.hash(), b.hash());
    }
}
