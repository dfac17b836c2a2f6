//! Support for the interposed allocation entry points.
//!
//! Every hook first enters a [`ReentryGuard`]. If the calling thread is
//! already inside a hook (logging, notification or symbol lookup
//! allocated), the guard is refused and the hook must call the bare
//! primitive without any tracking. The guard is released on every exit
//! path by `Drop`.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_void;

thread_local! {
    static INSIDE_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as being inside a hook.
pub struct ReentryGuard {
    // Must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl ReentryGuard {
    /// `None` if this thread already holds a guard, or if its thread-local
    /// storage is being torn down.
    pub fn enter() -> Option<Self> {
        INSIDE_HOOK
            .try_with(|inside| {
                if inside.replace(true) {
                    None
                } else {
                    Some(Self { _not_send: PhantomData })
                }
            })
            .ok()
            .flatten()
    }

    pub fn is_active() -> bool {
        INSIDE_HOOK.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = INSIDE_HOOK.try_with(|inside| inside.set(false));
    }
}

const ARENA_ALIGN: usize = 16;
const HEADER: usize = ARENA_ALIGN;

#[repr(C, align(16))]
struct ArenaBytes<const N: usize>([u8; N]);

/// Bump allocator for the few allocations made while the real allocator
/// is still being looked up. Memory is never reused; `free` of an arena
/// pointer is a no-op.
pub struct BootstrapArena<const N: usize> {
    bytes: UnsafeCell<ArenaBytes<N>>,
    next: AtomicUsize,
}

// SAFETY: disjoint regions are handed out through an atomic cursor.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self { bytes: UnsafeCell::new(ArenaBytes([0; N])), next: AtomicUsize::new(0) }
    }

    fn base(&self) -> usize {
        self.bytes.get() as usize
    }

    /// Zeroed memory of `size` bytes aligned to `align` (at most a page),
    /// or null when the arena is exhausted.
    pub fn alloc(&self, size: usize, align: usize) -> *mut c_void {
        let align = align.max(ARENA_ALIGN);
        if !align.is_power_of_two() || align > 4096 {
            return ptr::null_mut();
        }
        let base = self.base();
        let mut cursor = self.next.load(Ordering::Relaxed);
        loop {
            let user = (base + cursor + HEADER + align - 1) & !(align - 1);
            let Some(end) = (user - base).checked_add(size) else {
                return ptr::null_mut();
            };
            if end > N {
                return ptr::null_mut();
            }
            match self.next.compare_exchange_weak(cursor, end, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    // SAFETY: [user - HEADER, user + size) lies inside the
                    // region this thread just claimed.
                    unsafe { ptr::write((user - mem::size_of::<usize>()) as *mut usize, size) };
                    return user as *mut c_void;
                }
                Err(current) => cursor = current,
            }
        }
    }

    pub fn contains(&self, ptr: *const c_void) -> bool {
        let addr = ptr as usize;
        addr >= self.base() && addr < self.base() + N
    }

    /// Requested size of an arena allocation.
    pub fn size_of(&self, ptr: *const c_void) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        // SAFETY: every pointer handed out is preceded by its size.
        Some(unsafe { ptr::read((ptr as usize - mem::size_of::<usize>()) as *const usize) })
    }

    pub fn used(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}
