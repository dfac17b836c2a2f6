use std::fmt;

use numaflux_io::{align_down, align_up, MapEntry};

/// Where a segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Heap,
    Stack,
    Text,
    Data,
    Anonymous,
    Malloc,
    Calloc,
    Realloc,
    ReallocArray,
    PosixMemalign,
    Mmap,
}

impl SegmentKind {
    /// Heap, stack, text and data are discovered once and never removed.
    pub fn is_distinguished(self) -> bool {
        matches!(self, SegmentKind::Heap | SegmentKind::Stack | SegmentKind::Text | SegmentKind::Data)
    }

    /// Blocks handed out by the malloc family, released with `free`.
    pub fn is_allocation(self) -> bool {
        matches!(
            self,
            SegmentKind::Malloc
                | SegmentKind::Calloc
                | SegmentKind::Realloc
                | SegmentKind::ReallocArray
                | SegmentKind::PosixMemalign
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Heap => "heap",
            SegmentKind::Stack => "stack",
            SegmentKind::Text => "text",
            SegmentKind::Data => "data",
            SegmentKind::Anonymous => "anonymous",
            SegmentKind::Malloc => "malloc",
            SegmentKind::Calloc => "calloc",
            SegmentKind::Realloc => "realloc",
            SegmentKind::ReallocArray => "reallocarray",
            SegmentKind::PosixMemalign => "posix_memalign",
            SegmentKind::Mmap => "mmap",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contiguous address range. `end` is inclusive, so `start <= end`
/// always holds and a segment covers at least one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    start: usize,
    end: usize,
    kind: SegmentKind,
}

impl MemorySegment {
    /// Returns `None` when `end < start`.
    pub fn new(start: usize, end: usize, kind: SegmentKind) -> Option<Self> {
        (start <= end).then_some(Self { start, end, kind })
    }

    /// A segment of `len` bytes at `start`. Zero-length requests still
    /// occupy one byte, as the allocator hands out a unique pointer for them.
    pub fn with_len(start: usize, len: usize, kind: SegmentKind) -> Self {
        let end = start.saturating_add(len.max(1) - 1);
        Self { start, end, kind }
    }

    /// Converts a map line (exclusive end) into a segment.
    pub fn from_map_entry(entry: &MapEntry, kind: SegmentKind) -> Option<Self> {
        (entry.end > entry.start).then(|| Self { start: entry.start, end: entry.end - 1, kind })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub(crate) fn set_end(&mut self, end: usize) {
        self.end = end.max(self.start);
    }

    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn overlaps(&self, other: &MemorySegment) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn page_aligned_start(&self, page: usize) -> usize {
        align_down(self.start, page)
    }

    /// First page boundary past the segment (exclusive).
    pub fn page_aligned_end(&self, page: usize) -> usize {
        align_up(self.end.saturating_add(1), page)
    }

    pub fn page_aligned_len(&self, page: usize) -> usize {
        self.page_aligned_end(page) - self.page_aligned_start(page)
    }
}

impl fmt::Display for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#014x}-{:#014x}] {:>10} KiB  {}",
            self.start,
            self.end,
            self.len() / 1024,
            self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn test_geometry_of_unaligned_segment() {
        let seg = MemorySegment::with_len(0x1010, 0x2000, SegmentKind::Malloc);
        assert_eq!(seg.end(), 0x300f);
        assert_eq!(seg.len(), 0x2000);
        assert_eq!(seg.page_aligned_start(PAGE), 0x1000);
        assert_eq!(seg.page_aligned_end(PAGE), 0x4000);
        assert_eq!(seg.page_aligned_len(PAGE), 0x3000);
    }

    #[test]
    fn test_zero_length_allocation_covers_one_byte() {
        let seg = MemorySegment::with_len(0x5000, 0, SegmentKind::Malloc);
        assert_eq!(seg.start(), seg.end());
        assert_eq!(seg.len(), 1);
        assert_eq!(seg.page_aligned_len(PAGE), PAGE);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        assert!(MemorySegment::new(0x2000, 0x1fff, SegmentKind::Mmap).is_none());
        assert!(MemorySegment::new(0x2000, 0x2000, SegmentKind::Mmap).is_some());
    }

    #[test]
    fn test_overlap_and_containment() {
        let a = MemorySegment::new(0x1000, 0x1fff, SegmentKind::Mmap).unwrap();
        let b = MemorySegment::new(0x2000, 0x2fff, SegmentKind::Mmap).unwrap();
        let c = MemorySegment::new(0x1800, 0x27ff, SegmentKind::Mmap).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c) && b.overlaps(&c));
        assert!(a.contains(0x1fff) && !a.contains(0x2000));
    }

    #[test]
    fn test_map_entry_end_becomes_inclusive() {
        let entry = MapEntry::parse("7f00-8000 rw-p 00000000 00:00 0").unwrap();
        let seg = MemorySegment::from_map_entry(&entry, SegmentKind::Anonymous).unwrap();
        assert_eq!(seg.end(), 0x7fff);
        assert_eq!(seg.kind().to_string(), "anonymous");
    }

    #[test]
    fn test_only_allocator_blocks_are_freed() {
        assert!(SegmentKind::PosixMemalign.is_allocation());
        assert!(SegmentKind::Realloc.is_allocation());
        assert!(!SegmentKind::Anonymous.is_allocation());
        assert!(!SegmentKind::Mmap.is_allocation());
        assert!(!SegmentKind::Heap.is_allocation());
    }
}
