use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libc::{c_int, c_void, off_t};
use log::{debug, info, trace};
use numaflux_io::{align_up, page_size, AddressSpaceSource, ImageBounds, RealFunctions};

use crate::error::{escalate, CoreError, Result};
use crate::segment::{MemorySegment, SegmentKind};

/// The allocation primitives the tracker wraps. The preload library passes
/// the resolved libc symbols; tests pass a simulated allocator.
///
/// # Safety
/// Implementations must behave like their libc namesakes.
pub trait AllocPrimitives: Send + Sync {
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void;
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
    unsafe fn reallocarray(&self, ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void;
    unsafe fn free(&self, ptr: *mut c_void);
    unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: usize, size: usize) -> c_int;
    unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void;
    unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int;
    /// Current program break (end of the heap, exclusive).
    fn program_break(&self) -> usize;
}

impl AllocPrimitives for RealFunctions {
    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        (self.malloc)(size)
    }

    unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        (self.calloc)(nmemb, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (self.realloc)(ptr, size)
    }

    unsafe fn reallocarray(&self, ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
        match self.reallocarray {
            Some(reallocarray) => reallocarray(ptr, nmemb, size),
            None => match nmemb.checked_mul(size) {
                Some(total) => (self.realloc)(ptr, total),
                None => {
                    *libc::__errno_location() = libc::ENOMEM;
                    std::ptr::null_mut()
                }
            },
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }

    unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: usize, size: usize) -> c_int {
        (self.posix_memalign)(out, align, size)
    }

    unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void {
        (self.mmap)(addr, len, prot, flags, fd, offset)
    }

    unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int {
        (self.munmap)(addr, len)
    }

    fn program_break(&self) -> usize {
        RealFunctions::program_break(self)
    }
}

/// Receives segment additions and removals. Called without the tracker
/// lock held.
pub trait SegmentObserver: Send + Sync {
    fn segment_added(&self, segment: &MemorySegment) -> Result<()>;
    fn segment_removed(&self, segment: &MemorySegment) -> Result<()>;
}

/// Live inventory of the process's memory regions.
///
/// Segments are kept in insertion order. The heap, stack, text and data
/// segments are found once at construction and never removed; every other
/// segment corresponds to one out-of-heap allocation or mapping. Mappings
/// are kept pairwise disjoint; an allocator block may lie inside an
/// anonymous mapping.
pub struct SegmentTracker {
    primitives: Arc<dyn AllocPrimitives>,
    observer: Arc<dyn SegmentObserver>,
    segments: Mutex<Vec<MemorySegment>>,
    heap_start: usize,
    heap_end: AtomicUsize,
    stack: MemorySegment,
    text: MemorySegment,
    data: MemorySegment,
}

#[derive(Default)]
struct Changes {
    removed: Vec<MemorySegment>,
    added: Vec<MemorySegment>,
}

impl SegmentTracker {
    /// Builds the initial inventory from `source` and reports every
    /// discovered segment except the stack to `observer`.
    pub fn new(
        primitives: Arc<dyn AllocPrimitives>,
        observer: Arc<dyn SegmentObserver>,
        source: &dyn AddressSpaceSource,
        bounds: ImageBounds,
    ) -> Result<Self> {
        let regions = source.regions()?;

        let mut segments = Vec::with_capacity(regions.len());
        let (mut heap, mut stack, mut text, mut data) = (None, None, None, None);

        for entry in &regions {
            let kind = if entry.name == "[heap]" {
                SegmentKind::Heap
            } else if entry.name == "[stack]" {
                SegmentKind::Stack
            } else if bounds.text_end > 0 && entry.contains(bounds.text_end - 1) {
                SegmentKind::Text
            } else if bounds.data_end > 0 && entry.contains(bounds.data_end - 1) {
                SegmentKind::Data
            } else if entry.name.is_empty() {
                SegmentKind::Anonymous
            } else {
                continue;
            };

            let Some(segment) = MemorySegment::from_map_entry(entry, kind) else {
                continue;
            };
            match kind {
                SegmentKind::Heap => heap = Some(segment),
                SegmentKind::Stack => stack = Some(segment),
                SegmentKind::Text => text = Some(segment),
                SegmentKind::Data => data = Some(segment),
                _ => {}
            }
            segments.push(segment);
        }

        let heap = heap.ok_or(CoreError::MissingSegment("heap"))?;
        let stack = stack.ok_or(CoreError::MissingSegment("stack"))?;
        let text = text.ok_or(CoreError::MissingSegment("text"))?;
        let data = data.ok_or(CoreError::MissingSegment("data"))?;

        let heap_end = primitives.program_break().max(heap.end() + 1);
        debug!(
            "Address space: {} segments, heap {:#x}-{:#x}, text ends {:#x}, data ends {:#x}",
            segments.len(),
            heap.start(),
            heap_end,
            bounds.text_end,
            bounds.data_end
        );

        let tracker = Self {
            primitives,
            observer,
            segments: Mutex::new(segments),
            heap_start: heap.start(),
            heap_end: AtomicUsize::new(heap_end),
            stack,
            text,
            data,
        };

        for segment in tracker.segments().iter().filter(|s| s.kind() != SegmentKind::Stack) {
            tracker.observer.segment_added(segment)?;
        }
        Ok(tracker)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MemorySegment>> {
        self.segments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every segment, with the heap's end at the current break.
    pub fn segments(&self) -> Vec<MemorySegment> {
        let heap_end = self.heap_end.load(Ordering::Acquire);
        let mut snapshot = self.lock().clone();
        for segment in snapshot.iter_mut().filter(|s| s.kind() == SegmentKind::Heap) {
            segment.set_end(heap_end - 1);
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn heap_range(&self) -> (usize, usize) {
        (self.heap_start, self.heap_end.load(Ordering::Acquire))
    }

    pub fn stack(&self) -> &MemorySegment {
        &self.stack
    }

    pub fn text(&self) -> &MemorySegment {
        &self.text
    }

    pub fn data(&self) -> &MemorySegment {
        &self.data
    }

    pub fn print(&self) {
        let segments = self.segments();
        info!("{} tracked segments:", segments.len());
        for segment in &segments {
            info!("  {}", segment);
        }
    }

    fn refresh_heap_end(&self) {
        let brk = self.primitives.program_break();
        if brk > self.heap_start {
            self.heap_end.store(brk, Ordering::Release);
        }
    }

    fn in_heap(&self, addr: usize) -> bool {
        self.refresh_heap_end();
        addr >= self.heap_start && addr < self.heap_end.load(Ordering::Acquire)
    }

    fn record(&self, addr: usize, len: usize, kind: SegmentKind) {
        if self.in_heap(addr) {
            return;
        }
        let mut changes = Changes::default();
        Self::insert(&mut self.lock(), MemorySegment::with_len(addr, len, kind), &mut changes);
        self.notify(&changes);
    }

    /// Only a new mapping replaces what was there before. Allocator blocks
    /// may sit inside an anonymous mapping, which then stays whole.
    fn insert(segments: &mut Vec<MemorySegment>, segment: MemorySegment, changes: &mut Changes) {
        trace!("track {}", segment);
        if segment.kind() == SegmentKind::Mmap {
            carve(segments, segment.start(), segment.end(), changes);
        }
        segments.push(segment);
        changes.added.push(segment);
    }

    fn forget(segments: &mut Vec<MemorySegment>, addr: usize) -> Option<MemorySegment> {
        let index = segments.iter().position(|s| s.start() == addr && s.kind().is_allocation())?;
        Some(segments.remove(index))
    }

    fn notify(&self, changes: &Changes) {
        for segment in &changes.removed {
            escalate(self.observer.segment_removed(segment));
        }
        for segment in &changes.added {
            escalate(self.observer.segment_added(segment));
        }
    }

    /// # Safety
    /// Same contract as libc `malloc`.
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        let ptr = self.primitives.malloc(size);
        if !ptr.is_null() {
            self.record(ptr as usize, size, SegmentKind::Malloc);
        }
        ptr
    }

    /// # Safety
    /// Same contract as libc `calloc`.
    pub unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        let ptr = self.primitives.calloc(nmemb, size);
        if !ptr.is_null() {
            self.record(ptr as usize, nmemb.saturating_mul(size), SegmentKind::Calloc);
        }
        ptr
    }

    /// # Safety
    /// Same contract as libc `realloc`.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        self.resize(ptr, size, SegmentKind::Realloc, |old| self.primitives.realloc(old, size))
    }

    /// # Safety
    /// Same contract as libc `reallocarray`.
    pub unsafe fn reallocarray(&self, ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
        let requested = nmemb.saturating_mul(size);
        self.resize(ptr, requested, SegmentKind::ReallocArray, |old| self.primitives.reallocarray(old, nmemb, size))
    }

    /// Covers the four heap/out-of-heap combinations of a resize.
    ///
    /// An out-of-heap block is resized with the lock held: once the
    /// allocator has released the old address, another thread may be handed
    /// it back, and its record must not be the one forgotten here.
    unsafe fn resize<F>(&self, old: *mut c_void, requested: usize, kind: SegmentKind, resize: F) -> *mut c_void
    where
        F: FnOnce(*mut c_void) -> *mut c_void,
    {
        if old.is_null() || self.in_heap(old as usize) {
            let new = resize(old);
            self.refresh_heap_end();
            if !new.is_null() {
                self.record(new as usize, requested, kind);
            }
            return new;
        }

        let mut changes = Changes::default();
        let new = {
            let mut segments = self.lock();
            let new = resize(old);
            // A failed resize leaves the old block untouched.
            if !new.is_null() || requested == 0 {
                if let Some(segment) = Self::forget(&mut segments, old as usize) {
                    changes.removed.push(segment);
                }
                if !new.is_null() && !self.in_heap(new as usize) {
                    Self::insert(&mut segments, MemorySegment::with_len(new as usize, requested, kind), &mut changes);
                }
            }
            new
        };
        self.notify(&changes);
        new
    }

    /// # Safety
    /// Same contract as libc `free`.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() || self.in_heap(ptr as usize) {
            self.primitives.free(ptr);
            self.refresh_heap_end();
            return;
        }

        let removed = {
            let mut segments = self.lock();
            self.primitives.free(ptr);
            Self::forget(&mut segments, ptr as usize)
        };
        if let Some(segment) = removed {
            trace!("untrack {}", segment);
            escalate(self.observer.segment_removed(&segment));
        }
    }

    /// # Safety
    /// Same contract as libc `posix_memalign`.
    pub unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: usize, size: usize) -> c_int {
        let ret = self.primitives.posix_memalign(out, align, size);
        if ret == 0 && !out.is_null() && !(*out).is_null() {
            self.record(*out as usize, size, SegmentKind::PosixMemalign);
        }
        ret
    }

    /// # Safety
    /// Same contract as libc `mmap`.
    pub unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void {
        let ptr = self.primitives.mmap(addr, len, prot, flags, fd, offset);
        if ptr != libc::MAP_FAILED {
            self.record(ptr as usize, len, SegmentKind::Mmap);
        }
        ptr
    }

    /// Unmapping part of a segment keeps the remaining head and tail as
    /// segments of their own.
    ///
    /// # Safety
    /// Same contract as libc `munmap`.
    pub unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int {
        let mut changes = Changes::default();
        let ret = {
            let mut segments = self.lock();
            let ret = self.primitives.munmap(addr, len);
            if ret == 0 && len > 0 {
                let start = addr as usize;
                let end = start.saturating_add(align_up(len, page_size())) - 1;
                carve(&mut segments, start, end, &mut changes);
            }
            ret
        };
        self.notify(&changes);
        ret
    }

    pub fn mremap(&self, _old: *mut c_void, _old_len: usize, _new_len: usize, _flags: c_int) -> Result<*mut c_void> {
        Err(CoreError::Unsupported("mremap"))
    }

    pub fn brk(&self, _addr: *mut c_void) -> Result<c_int> {
        Err(CoreError::Unsupported("brk"))
    }

    pub fn sbrk(&self, _increment: isize) -> Result<*mut c_void> {
        Err(CoreError::Unsupported("sbrk"))
    }

    pub fn mbind(&self, _addr: *mut c_void, _len: usize) -> Result<i64> {
        Err(CoreError::Unsupported("mbind"))
    }
}

/// Removes `[start, end]` from every non-distinguished segment, splitting
/// segments that only partially overlap.
fn carve(segments: &mut Vec<MemorySegment>, start: usize, end: usize, changes: &mut Changes) {
    let mut i = 0;
    while i < segments.len() {
        let segment = segments[i];
        if segment.kind().is_distinguished() || segment.end() < start || segment.start() > end {
            i += 1;
            continue;
        }

        segments.remove(i);
        changes.removed.push(segment);

        let head = (segment.start() < start).then(|| MemorySegment::new(segment.start(), start - 1, segment.kind()));
        let tail = (segment.end() > end).then(|| MemorySegment::new(end + 1, segment.end(), segment.kind()));
        for piece in [head, tail].into_iter().flatten().flatten() {
            segments.push(piece);
            changes.added.push(piece);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::placement::tests::{options, RecordingNuma};
    use crate::placement::{Distribution, PlacementEngine};
    use crate::weights::NodeWeightTable;
    use numaflux_io::maps::StaticMaps;
    use numaflux_io::NodeSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{OnceLock, Weak};
    use std::thread;

    pub(crate) const HEAP_BASE: usize = 0x1000_0000;
    const MAP_BASE: usize = 0x7f00_0000_0000;
    const SMALL_LIMIT: usize = 128 * 1024;

    pub(crate) const FIXTURE: &str = "\
00400000-00402000 r-xp 00000000 08:01 42        /usr/bin/app
00601000-00602000 rw-p 00001000 08:01 42        /usr/bin/app
10000000-10021000 rw-p 00000000 00:00 0         [heap]
7e0000000000-7e0000200000 rw-p 00000000 00:00 0
7e0000400000-7e0000401000 r--p 00000000 08:01 77        /usr/lib/libc.so.6
7ffc00000000-7ffc00021000 rw-p 00000000 00:00 0         [stack]
";

    pub(crate) const BOUNDS: ImageBounds = ImageBounds { text_end: 0x402000, data_end: 0x601800 };

    /// Heap-like bump allocation below `SMALL_LIMIT`, mmap-like above it.
    pub(crate) struct FakePrimitives {
        brk: AtomicUsize,
        next_map: AtomicUsize,
    }

    impl FakePrimitives {
        pub(crate) fn new() -> Self {
            Self { brk: AtomicUsize::new(HEAP_BASE + 0x21000), next_map: AtomicUsize::new(MAP_BASE) }
        }

        fn alloc(&self, size: usize) -> *mut c_void {
            if size < SMALL_LIMIT {
                self.brk.fetch_add(align_up(size.max(16), 16), Ordering::SeqCst) as *mut c_void
            } else {
                self.next_map.fetch_add(align_up(size, 4096) + 4096, Ordering::SeqCst) as *mut c_void
            }
        }
    }

    impl AllocPrimitives for FakePrimitives {
        unsafe fn malloc(&self, size: usize) -> *mut c_void {
            self.alloc(size)
        }
        unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
            self.alloc(nmemb * size)
        }
        unsafe fn realloc(&self, _ptr: *mut c_void, size: usize) -> *mut c_void {
            if size == 0 {
                return std::ptr::null_mut();
            }
            self.alloc(size)
        }
        unsafe fn reallocarray(&self, ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
            self.realloc(ptr, nmemb * size)
        }
        unsafe fn free(&self, _ptr: *mut c_void) {}
        unsafe fn posix_memalign(&self, out: *mut *mut c_void, _align: usize, size: usize) -> c_int {
            *out = self.alloc(size);
            0
        }
        unsafe fn mmap(&self, _addr: *mut c_void, len: usize, _prot: c_int, _flags: c_int, _fd: c_int, _offset: off_t) -> *mut c_void {
            self.next_map.fetch_add(align_up(len, 4096) + 4096, Ordering::SeqCst) as *mut c_void
        }
        unsafe fn munmap(&self, _addr: *mut c_void, _len: usize) -> c_int {
            0
        }
        fn program_break(&self) -> usize {
            self.brk.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) events: Mutex<Vec<(bool, MemorySegment)>>,
    }

    impl RecordingObserver {
        fn added(&self) -> Vec<MemorySegment> {
            self.events.lock().unwrap().iter().filter(|(a, _)| *a).map(|(_, s)| *s).collect()
        }
        fn removed(&self) -> Vec<MemorySegment> {
            self.events.lock().unwrap().iter().filter(|(a, _)| !*a).map(|(_, s)| *s).collect()
        }
        fn clear(&self) {
            self.events.lock().unwrap().clear();
        }
    }

    impl SegmentObserver for RecordingObserver {
        fn segment_added(&self, segment: &MemorySegment) -> Result<()> {
            self.events.lock().unwrap().push((true, *segment));
            Ok(())
        }
        fn segment_removed(&self, segment: &MemorySegment) -> Result<()> {
            self.events.lock().unwrap().push((false, *segment));
            Ok(())
        }
    }

    fn tracker() -> (SegmentTracker, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let tracker = SegmentTracker::new(
            Arc::new(FakePrimitives::new()),
            observer.clone(),
            &StaticMaps(FIXTURE.to_string()),
            BOUNDS,
        )
        .unwrap();
        (tracker, observer)
    }

    fn assert_disjoint(segments: &[MemorySegment]) {
        let dynamic: Vec<_> = segments.iter().filter(|s| !s.kind().is_distinguished()).collect();
        for (i, a) in dynamic.iter().enumerate() {
            assert!(a.start() <= a.end());
            for b in &dynamic[i + 1..] {
                assert!(!a.overlaps(b), "{} overlaps {}", a, b);
            }
        }
    }

    #[test]
    fn test_initial_classification() {
        let (tracker, observer) = tracker();
        let kinds: Vec<_> = tracker.segments().iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![SegmentKind::Text, SegmentKind::Data, SegmentKind::Heap, SegmentKind::Anonymous, SegmentKind::Stack]
        );
        assert_eq!(tracker.text().end(), 0x401fff);
        assert_eq!(tracker.stack().start(), 0x7ffc00000000);

        // Everything but the stack is announced.
        let added = observer.added();
        assert_eq!(added.len(), 4);
        assert!(added.iter().all(|s| s.kind() != SegmentKind::Stack));
    }

    #[test]
    fn test_missing_distinguished_segment_is_fatal() {
        let without_heap: String = FIXTURE.lines().filter(|l| !l.contains("[heap]")).map(|l| format!("{}\n", l)).collect();
        let err = SegmentTracker::new(
            Arc::new(FakePrimitives::new()),
            Arc::new(RecordingObserver::default()),
            &StaticMaps(without_heap),
            BOUNDS,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CoreError::MissingSegment("heap")));

        let bad_bounds = ImageBounds { text_end: 0x900000, data_end: 0x601800 };
        let err = SegmentTracker::new(
            Arc::new(FakePrimitives::new()),
            Arc::new(RecordingObserver::default()),
            &StaticMaps(FIXTURE.to_string()),
            bad_bounds,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CoreError::MissingSegment("text")));
    }

    #[test]
    fn test_heap_allocation_only_moves_the_break() {
        let (tracker, observer) = tracker();
        observer.clear();
        let before = tracker.len();

        let p = unsafe { tracker.malloc(64) };
        assert!((p as usize) >= HEAP_BASE);
        assert_eq!(tracker.len(), before);
        assert!(observer.events.lock().unwrap().is_empty());

        let (_, end) = tracker.heap_range();
        assert!(end > p as usize);
        let heap = tracker.segments().into_iter().find(|s| s.kind() == SegmentKind::Heap).unwrap();
        assert_eq!(heap.end(), end - 1);
        unsafe { tracker.free(p) };
        assert!(observer.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_heap_lifecycle() {
        let (tracker, observer) = tracker();
        observer.clear();

        let p = unsafe { tracker.malloc(4 << 20) };
        let added = observer.added();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].start(), p as usize);
        assert_eq!(added[0].len(), 4 << 20);
        assert_eq!(added[0].kind(), SegmentKind::Malloc);

        unsafe { tracker.free(p) };
        let removed = observer.removed();
        assert_eq!(removed, added);
        assert!(tracker.segments().iter().all(|s| s.start() != p as usize));
    }

    #[test]
    fn test_realloc_across_the_heap_boundary() {
        let (tracker, observer) = tracker();
        observer.clear();

        // heap -> out of heap
        let small = unsafe { tracker.malloc(32) };
        let big = unsafe { tracker.realloc(small, 1 << 20) };
        assert!(observer.removed().is_empty());
        assert_eq!(observer.added().len(), 1);
        assert_eq!(observer.added()[0].kind(), SegmentKind::Realloc);

        // out of heap -> out of heap
        observer.clear();
        let bigger = unsafe { tracker.reallocarray(big, 2, 1 << 20) };
        assert_eq!(observer.removed()[0].start(), big as usize);
        assert_eq!(observer.added()[0].start(), bigger as usize);
        assert_eq!(observer.added()[0].len(), 2 << 20);

        // out of heap -> heap
        observer.clear();
        let back = unsafe { tracker.realloc(bigger, 16) };
        assert!(tracker.heap_range().0 <= back as usize);
        assert_eq!(observer.removed().len(), 1);
        assert!(observer.added().is_empty());

        // realloc(ptr, 0) frees
        observer.clear();
        let p = unsafe { tracker.calloc(1, 1 << 20) };
        assert_eq!(observer.added()[0].kind(), SegmentKind::Calloc);
        let gone = unsafe { tracker.realloc(p, 0) };
        assert!(gone.is_null());
        assert_eq!(observer.removed()[0].start(), p as usize);
    }

    #[test]
    fn test_partial_munmap_splits_the_mapping() {
        let (tracker, observer) = tracker();
        observer.clear();

        let base = unsafe { tracker.mmap(std::ptr::null_mut(), 16 * 4096, 0, 0, -1, 0) } as usize;
        let hole = (base + 4 * 4096) as *mut c_void;
        assert_eq!(unsafe { tracker.munmap(hole, 4096) }, 0);

        let pieces: Vec<_> = tracker.segments().into_iter().filter(|s| s.kind() == SegmentKind::Mmap).collect();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].start(), base);
        assert_eq!(pieces[0].len(), 4 * 4096);
        assert_eq!(pieces[1].start(), base + 5 * 4096);
        assert_eq!(pieces[1].len(), 11 * 4096);
        assert_disjoint(&tracker.segments());
    }

    #[test]
    fn test_posix_memalign_is_tracked() {
        let (tracker, observer) = tracker();
        observer.clear();
        let mut out: *mut c_void = std::ptr::null_mut();
        assert_eq!(unsafe { tracker.posix_memalign(&mut out, 4096, 1 << 20) }, 0);
        assert_eq!(observer.added()[0].start(), out as usize);
        assert_eq!(observer.added()[0].kind(), SegmentKind::PosixMemalign);
    }

    #[test]
    fn test_concurrent_hooks_keep_segments_disjoint() {
        let (tracker, _) = tracker();
        let tracker = Arc::new(tracker);
        let initial = tracker.len();

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..200 {
                        let size = if (i + t) % 3 == 0 { 64 } else { 256 * 1024 };
                        let p = unsafe { tracker.malloc(size) };
                        match i % 4 {
                            0 => unsafe { tracker.free(p) },
                            1 => kept.push(unsafe { tracker.realloc(p, 512 * 1024) } as usize),
                            2 => kept.push(unsafe { tracker.reallocarray(p, 2, size) } as usize),
                            _ => kept.push(p as usize),
                        }
                    }
                    kept
                })
            })
            .collect();
        let kept: Vec<usize> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

        let segments = tracker.segments();
        assert_disjoint(&segments);
        let (heap_start, heap_end) = tracker.heap_range();
        for &p in &kept {
            let in_heap = p >= heap_start && p < heap_end;
            let tracked = segments.iter().filter(|s| s.start() == p && s.kind().is_allocation()).count();
            assert_eq!(tracked, usize::from(!in_heap), "block {:#x}", p);
        }
        for p in kept {
            unsafe { tracker.free(p as *mut c_void) };
        }
        assert_eq!(tracker.len(), initial);
    }

    const MOVED_TO: usize = 0x7f10_0000_0000;
    const CONTENDED_SIZE: usize = 3 << 20;

    /// While a resize is in flight, hands the old address to another
    /// thread's malloc, as a real allocator may once the block is released.
    struct ContendedPrimitives {
        inner: FakePrimitives,
        tracker: OnceLock<Weak<SegmentTracker>>,
        handed_out: AtomicBool,
        contender: Mutex<Option<thread::JoinHandle<()>>>,
    }

    impl AllocPrimitives for ContendedPrimitives {
        unsafe fn malloc(&self, size: usize) -> *mut c_void {
            if size == CONTENDED_SIZE {
                self.handed_out.store(true, Ordering::SeqCst);
                return MAP_BASE as *mut c_void;
            }
            self.inner.malloc(size)
        }
        unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
            self.inner.calloc(nmemb, size)
        }
        unsafe fn realloc(&self, _ptr: *mut c_void, _size: usize) -> *mut c_void {
            let tracker = self.tracker.get().and_then(Weak::upgrade).expect("tracker installed");
            let contender = thread::spawn(move || {
                unsafe { tracker.malloc(CONTENDED_SIZE) };
            });
            while !self.handed_out.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            *self.contender.lock().unwrap() = Some(contender);
            MOVED_TO as *mut c_void
        }
        unsafe fn reallocarray(&self, ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
            self.realloc(ptr, nmemb * size)
        }
        unsafe fn free(&self, ptr: *mut c_void) {
            self.inner.free(ptr)
        }
        unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: usize, size: usize) -> c_int {
            self.inner.posix_memalign(out, align, size)
        }
        unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void {
            self.inner.mmap(addr, len, prot, flags, fd, offset)
        }
        unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int {
            self.inner.munmap(addr, len)
        }
        fn program_break(&self) -> usize {
            self.inner.program_break()
        }
    }

    #[test]
    fn test_resize_keeps_an_address_reused_by_another_thread() {
        let primitives = Arc::new(ContendedPrimitives {
            inner: FakePrimitives::new(),
            tracker: OnceLock::new(),
            handed_out: AtomicBool::new(false),
            contender: Mutex::new(None),
        });
        let tracker = Arc::new(
            SegmentTracker::new(
                primitives.clone(),
                Arc::new(RecordingObserver::default()),
                &StaticMaps(FIXTURE.to_string()),
                BOUNDS,
            )
            .unwrap(),
        );
        assert!(primitives.tracker.set(Arc::downgrade(&tracker)).is_ok());

        let old = unsafe { tracker.malloc(1 << 20) };
        assert_eq!(old as usize, MAP_BASE);
        let new = unsafe { tracker.realloc(old, 2 << 20) };
        assert_eq!(new as usize, MOVED_TO);
        primitives.contender.lock().unwrap().take().unwrap().join().unwrap();

        let blocks: Vec<_> = tracker
            .segments()
            .into_iter()
            .filter(|s| s.kind().is_allocation())
            .map(|s| (s.start(), s.kind()))
            .collect();
        assert_eq!(blocks.len(), 2, "{:x?}", blocks);
        assert!(blocks.contains(&(MAP_BASE, SegmentKind::Malloc)));
        assert!(blocks.contains(&(MOVED_TO, SegmentKind::Realloc)));
    }

    const NESTED: usize = 0x7e00_0010_0010;

    /// Serves small requests from inside the fixture's anonymous mapping,
    /// the way an allocator arena does.
    struct ArenaPrimitives(FakePrimitives);

    impl AllocPrimitives for ArenaPrimitives {
        unsafe fn malloc(&self, size: usize) -> *mut c_void {
            if size < SMALL_LIMIT {
                return NESTED as *mut c_void;
            }
            self.0.malloc(size)
        }
        unsafe fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
            self.0.calloc(nmemb, size)
        }
        unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
            self.0.realloc(ptr, size)
        }
        unsafe fn reallocarray(&self, ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
            self.0.reallocarray(ptr, nmemb, size)
        }
        unsafe fn free(&self, ptr: *mut c_void) {
            self.0.free(ptr)
        }
        unsafe fn posix_memalign(&self, out: *mut *mut c_void, align: usize, size: usize) -> c_int {
            self.0.posix_memalign(out, align, size)
        }
        unsafe fn mmap(&self, addr: *mut c_void, len: usize, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void {
            self.0.mmap(addr, len, prot, flags, fd, offset)
        }
        unsafe fn munmap(&self, addr: *mut c_void, len: usize) -> c_int {
            self.0.munmap(addr, len)
        }
        fn program_break(&self) -> usize {
            self.0.program_break()
        }
    }

    #[test]
    fn test_block_inside_a_mapping_leaves_it_whole() {
        let observer = Arc::new(RecordingObserver::default());
        let tracker = SegmentTracker::new(
            Arc::new(ArenaPrimitives(FakePrimitives::new())),
            observer.clone(),
            &StaticMaps(FIXTURE.to_string()),
            BOUNDS,
        )
        .unwrap();
        let nodes = NodeSet::first_n(2);
        let engine = PlacementEngine::new(
            Arc::new(RecordingNuma::default()),
            nodes.clone(),
            NodeSet::single(0),
            NodeWeightTable::uniform(&nodes).unwrap(),
            options(),
        )
        .unwrap();

        let before = tracker.segments();
        let swept = engine.place_all(&before, Distribution::Ratio(1.0)).unwrap();
        assert_eq!(swept.bytes, 2 << 20);
        observer.clear();

        let p = unsafe { tracker.malloc(32) };
        assert_eq!(p as usize, NESTED);
        assert!(observer.removed().is_empty());
        assert!(tracker.segments().iter().any(|s| s.kind() == SegmentKind::Anonymous && s.len() == 2 << 20));

        unsafe { tracker.free(p) };
        assert_eq!(tracker.segments(), before);
        assert_eq!(engine.place_all(&tracker.segments(), Distribution::Ratio(1.0)).unwrap(), swept);
    }

    #[test]
    fn test_new_mapping_replaces_what_it_covers() {
        let (tracker, observer) = tracker();
        observer.clear();
        let base = unsafe { tracker.mmap(std::ptr::null_mut(), 8 * 4096, 0, 0, -1, 0) } as usize;
        // A fixed mapping over the upper half of the first one.
        let upper = MemorySegment::with_len(base + 4 * 4096, 4 * 4096, SegmentKind::Mmap);
        let mut segments = tracker.segments();
        let mut changes = Changes::default();
        SegmentTracker::insert(&mut segments, upper, &mut changes);
        assert_eq!(changes.removed.len(), 1);
        assert_disjoint(&segments);
        assert!(segments.iter().any(|s| s.start() == base && s.len() == 4 * 4096));
    }

    #[test]
    fn test_break_style_calls_are_rejected() {
        let (tracker, _) = tracker();
        assert!(matches!(tracker.sbrk(4096), Err(CoreError::Unsupported("sbrk"))));
        assert!(matches!(tracker.brk(std::ptr::null_mut()), Err(CoreError::Unsupported("brk"))));
        assert!(matches!(
            tracker.mremap(std::ptr::null_mut(), 0, 4096, 0),
            Err(CoreError::Unsupported("mremap"))
        ));
        assert!(matches!(tracker.mbind(std::ptr::null_mut(), 0), Err(CoreError::Unsupported("mbind"))));
    }
}
