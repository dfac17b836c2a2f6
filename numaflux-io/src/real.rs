use std::mem;

use libc::{c_char, c_int, c_long, c_uint, c_ulong, c_void, intptr_t, off_t, size_t};
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("could not resolve the original '{0}' symbol")]
    Missing(&'static str),
}

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type ReallocArrayFn = unsafe extern "C" fn(*mut c_void, size_t, size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int;
pub type MmapFn = unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
pub type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;
pub type MremapFn = unsafe extern "C" fn(*mut c_void, size_t, size_t, c_int, *mut c_void) -> *mut c_void;
pub type BrkFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type SbrkFn = unsafe extern "C" fn(intptr_t) -> *mut c_void;
pub type MbindFn = unsafe extern "C" fn(*mut c_void, c_ulong, c_int, *const c_ulong, c_ulong, c_uint) -> c_long;

/// The next definitions of the interposed symbols in lookup order, i.e. the
/// allocator and mapping functions the application would have called
/// without us.
#[derive(Clone, Copy)]
pub struct RealFunctions {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub reallocarray: Option<ReallocArrayFn>,
    pub free: FreeFn,
    pub posix_memalign: PosixMemalignFn,
    pub mmap: MmapFn,
    pub munmap: MunmapFn,
    pub mremap: MremapFn,
    pub brk: BrkFn,
    pub sbrk: SbrkFn,
    /// Only present when libnuma is loaded.
    pub mbind: Option<MbindFn>,
}

impl RealFunctions {
    /// Resolves every symbol with `dlsym(RTLD_NEXT, ..)`.
    ///
    /// `dlsym` itself may allocate, so callers must be ready to serve
    /// re-entrant allocation requests without these pointers.
    pub fn resolve() -> Result<Self, SymbolError> {
        // SAFETY: each symbol is transmuted to the prototype glibc declares for it.
        let real = unsafe {
            Self {
                malloc: mem::transmute(required("malloc", b"malloc\0")?),
                calloc: mem::transmute(required("calloc", b"calloc\0")?),
                realloc: mem::transmute(required("realloc", b"realloc\0")?),
                reallocarray: optional(b"reallocarray\0").map(|p| mem::transmute::<*mut c_void, ReallocArrayFn>(p)),
                free: mem::transmute(required("free", b"free\0")?),
                posix_memalign: mem::transmute(required("posix_memalign", b"posix_memalign\0")?),
                mmap: mem::transmute(required("mmap", b"mmap\0")?),
                munmap: mem::transmute(required("munmap", b"munmap\0")?),
                mremap: mem::transmute(required("mremap", b"mremap\0")?),
                brk: mem::transmute(required("brk", b"brk\0")?),
                sbrk: mem::transmute(required("sbrk", b"sbrk\0")?),
                mbind: optional(b"mbind\0").map(|p| mem::transmute::<*mut c_void, MbindFn>(p)),
            }
        };
        debug!("Resolved original allocation symbols");
        Ok(real)
    }

    /// Current program break.
    pub fn program_break(&self) -> usize {
        // SAFETY: sbrk(0) only queries the break.
        unsafe { (self.sbrk)(0) as usize }
    }
}

fn optional(name: &[u8]) -> Option<*mut c_void> {
    // SAFETY: name is NUL-terminated.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) };
    (!sym.is_null()).then_some(sym)
}

fn required(symbol: &'static str, name: &[u8]) -> Result<*mut c_void, SymbolError> {
    optional(name).ok_or(SymbolError::Missing(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_allocator_round_trip() {
        let real = RealFunctions::resolve().unwrap();
        unsafe {
            let p = (real.malloc)(64);
            assert!(!p.is_null());
            let p = (real.realloc)(p, 4096);
            assert!(!p.is_null());
            (real.free)(p);
        }
        assert!(real.program_break() > 0);
    }
}
