//! NUMAflux preload library.
//!
//! Loaded with `LD_PRELOAD`, it shadows the libc allocation and mapping
//! entry points, builds the [`Runtime`] from `NUMAFLUX_*` variables when the
//! library is loaded and exposes a small C control API.
//!
//! Every hook falls through to the original symbol when the runtime is not
//! up yet or the calling thread is already inside a hook. Allocations made
//! while the original symbols are still being resolved come from a static
//! arena.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_long, c_uint, c_ulong, c_void, intptr_t, off_t, size_t};
use log::{info, warn, LevelFilter};
use numaflux_core::{escalate, terminate, BootstrapArena, CoreError, ReentryGuard, Runtime, RuntimeConfig};
use numaflux_io::RealFunctions;

const ARENA_BYTES: usize = 64 * 1024;

static REAL: OnceLock<RealFunctions> = OnceLock::new();
static RESOLVING: AtomicBool = AtomicBool::new(false);
static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static ARENA: BootstrapArena<ARENA_BYTES> = BootstrapArena::new();

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = numaflux_init;

#[used]
#[link_section = ".fini_array"]
static FINI: extern "C" fn() = numaflux_fini;

/// The original symbols, resolving them on first use. `None` while a
/// resolution is in flight.
fn real() -> Option<&'static RealFunctions> {
    if let Some(real) = REAL.get() {
        return Some(real);
    }
    if RESOLVING.swap(true, Ordering::AcqRel) {
        return None;
    }
    match RealFunctions::resolve() {
        Ok(real) => {
            let _ = REAL.set(real);
        }
        Err(e) => terminate(&CoreError::from(e)),
    }
    RESOLVING.store(false, Ordering::Release);
    REAL.get()
}

/// The runtime, if it is up and this thread is not inside a hook already.
fn hooked() -> Option<(ReentryGuard, &'static Runtime)> {
    let runtime = RUNTIME.get()?;
    let guard = ReentryGuard::enter()?;
    Some((guard, runtime))
}

fn init_logging(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .format_timestamp_micros()
        .try_init();
}

extern "C" fn numaflux_init() {
    let Some(_guard) = ReentryGuard::enter() else {
        return;
    };
    let Some(real) = real() else {
        return;
    };

    let config = RuntimeConfig::from_env().unwrap_or_else(|e| terminate(&e));
    if config.print_options {
        eprintln!("{}", RuntimeConfig::help_text());
        std::process::exit(0);
    }
    init_logging(config.level_filter().unwrap_or(LevelFilter::Info));

    // The [heap] mapping only exists once the break has moved.
    // SAFETY: plain allocate/release through the original allocator.
    unsafe { (real.free)((real.malloc)(1)) };

    let autostart = config.autostart;
    let Some(runtime) = escalate(Runtime::live(config, Arc::new(*real))) else {
        return;
    };
    let runtime = RUNTIME.get_or_init(|| runtime);
    info!("numaflux loaded in process {}", std::process::id());

    if autostart {
        escalate(runtime.start());
    }
}

extern "C" fn numaflux_fini() {
    let Some(_guard) = ReentryGuard::enter() else {
        return;
    };
    if let Some(runtime) = RUNTIME.get() {
        runtime.shutdown();
    }
}

/// Copies an arena block into a fresh allocation.
unsafe fn grow_from_arena(old: *mut c_void, size: size_t) -> *mut c_void {
    let new = malloc(size);
    if !new.is_null() {
        let keep = ARENA.size_of(old).unwrap_or(0).min(size);
        ptr::copy_nonoverlapping(old as *const u8, new as *mut u8, keep);
    }
    new
}

/// # Safety
/// C `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let Some(real) = real() else {
        return ARENA.alloc(size, 16);
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().malloc(size),
        None => (real.malloc)(size),
    }
}

/// # Safety
/// C `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real() else {
        // Arena memory is never reused, so it is still zeroed.
        return match nmemb.checked_mul(size) {
            Some(total) => ARENA.alloc(total, 16),
            None => ptr::null_mut(),
        };
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().calloc(nmemb, size),
        None => (real.calloc)(nmemb, size),
    }
}

/// # Safety
/// C `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if ARENA.contains(ptr) {
        return grow_from_arena(ptr, size);
    }
    let Some(real) = real() else {
        return ptr::null_mut();
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().realloc(ptr, size),
        None => (real.realloc)(ptr, size),
    }
}

/// # Safety
/// C `reallocarray`.
#[no_mangle]
pub unsafe extern "C" fn reallocarray(ptr: *mut c_void, nmemb: size_t, size: size_t) -> *mut c_void {
    if ARENA.contains(ptr) {
        return match nmemb.checked_mul(size) {
            Some(total) => grow_from_arena(ptr, total),
            None => ptr::null_mut(),
        };
    }
    let Some(real) = real() else {
        return ptr::null_mut();
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().reallocarray(ptr, nmemb, size),
        None => numaflux_core::AllocPrimitives::reallocarray(real, ptr, nmemb, size),
    }
}

/// # Safety
/// C `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || ARENA.contains(ptr) {
        return;
    }
    let Some(real) = real() else {
        return;
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().free(ptr),
        None => (real.free)(ptr),
    }
}

/// # Safety
/// C `posix_memalign`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, align: size_t, size: size_t) -> c_int {
    let Some(real) = real() else {
        let ptr = ARENA.alloc(size, align);
        if ptr.is_null() {
            return libc::ENOMEM;
        }
        *out = ptr;
        return 0;
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().posix_memalign(out, align, size),
        None => (real.posix_memalign)(out, align, size),
    }
}

/// # Safety
/// C `mmap`.
#[no_mangle]
pub unsafe extern "C" fn mmap(addr: *mut c_void, len: size_t, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void {
    let Some(real) = real() else {
        return libc::syscall(libc::SYS_mmap, addr, len, prot, flags, fd, offset) as *mut c_void;
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().mmap(addr, len, prot, flags, fd, offset),
        None => (real.mmap)(addr, len, prot, flags, fd, offset),
    }
}

/// # Safety
/// C `munmap`.
#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: size_t) -> c_int {
    let Some(real) = real() else {
        return libc::syscall(libc::SYS_munmap, addr, len) as c_int;
    };
    match hooked() {
        Some((_guard, runtime)) => runtime.tracker().munmap(addr, len),
        None => (real.munmap)(addr, len),
    }
}

/// # Safety
/// C `mremap`. Terminates the process once the runtime is up.
#[no_mangle]
pub unsafe extern "C" fn mremap(old: *mut c_void, old_len: size_t, new_len: size_t, flags: c_int, new_addr: *mut c_void) -> *mut c_void {
    let Some(real) = real() else {
        return libc::MAP_FAILED;
    };
    match hooked() {
        Some((_guard, runtime)) => {
            escalate(runtime.tracker().mremap(old, old_len, new_len, flags)).unwrap_or(libc::MAP_FAILED)
        }
        None => (real.mremap)(old, old_len, new_len, flags, new_addr),
    }
}

/// # Safety
/// C `brk`. Terminates the process once the runtime is up.
#[no_mangle]
pub unsafe extern "C" fn brk(addr: *mut c_void) -> c_int {
    let Some(real) = real() else {
        return -1;
    };
    match hooked() {
        Some((_guard, runtime)) => escalate(runtime.tracker().brk(addr)).unwrap_or(-1),
        None => (real.brk)(addr),
    }
}

/// # Safety
/// C `sbrk`. Terminates the process once the runtime is up.
#[no_mangle]
pub unsafe extern "C" fn sbrk(increment: intptr_t) -> *mut c_void {
    let Some(real) = real() else {
        return usize::MAX as *mut c_void;
    };
    match hooked() {
        Some((_guard, runtime)) => escalate(runtime.tracker().sbrk(increment)).unwrap_or(usize::MAX as *mut c_void),
        None => (real.sbrk)(increment),
    }
}

/// # Safety
/// libnuma `mbind`. Terminates the process once the runtime is up.
#[no_mangle]
pub unsafe extern "C" fn mbind(
    addr: *mut c_void,
    len: c_ulong,
    mode: c_int,
    nodemask: *const c_ulong,
    maxnode: c_ulong,
    flags: c_uint,
) -> c_long {
    if let Some((_guard, runtime)) = hooked() {
        return escalate(runtime.tracker().mbind(addr, len as usize)).unwrap_or(-1);
    }
    match real().and_then(|r| r.mbind) {
        Some(mbind) => mbind(addr, len, mode, nodemask, maxnode, flags),
        None => libc::syscall(libc::SYS_mbind, addr, len, mode, nodemask, maxnode, flags),
    }
}

fn control(name: &str, action: impl FnOnce(&Runtime)) {
    let Some(_guard) = ReentryGuard::enter() else {
        return;
    };
    match RUNTIME.get() {
        Some(runtime) => action(runtime),
        None => warn!("{}: numaflux is not initialised", name),
    }
}

/// Starts the configured strategy. Only the first call has an effect.
#[no_mangle]
pub extern "C" fn numaflux_start() {
    control("numaflux_start", |runtime| {
        escalate(runtime.start());
    });
}

/// Does nothing. Linking against it is enough to load the library without
/// `LD_PRELOAD`.
#[no_mangle]
pub extern "C" fn numaflux_nop() {}

#[no_mangle]
pub extern "C" fn numaflux_print_memory() {
    control("numaflux_print_memory", Runtime::print_memory);
}

#[no_mangle]
pub extern "C" fn numaflux_print_status() {
    control("numaflux_print_status", Runtime::print_status);
}
