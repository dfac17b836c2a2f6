use libc::{c_int, c_long, c_ulong, c_void};
use log::trace;
use nix::errno::Errno;
use thiserror::Error;

use crate::memory::NodeSet;

// <numaif.h> values, not exported by the libc crate.
const MPOL_BIND: c_int = 2;
const MPOL_INTERLEAVE: c_int = 3;
const MPOL_MF_STRICT: c_ulong = 1 << 0;
const MPOL_MF_MOVE: c_ulong = 1 << 1;

#[derive(Error, Debug)]
pub enum NumaError {
    #[error("mbind({addr:#x}, {len}, {policy:?}, {nodes:?}) failed: {errno}")]
    BindFailed {
        addr: usize,
        len: usize,
        policy: MemPolicy,
        nodes: NodeSet,
        errno: Errno,
    },
    #[error("move_pages over {pages} pages failed: {errno}")]
    MoveFailed { pages: usize, errno: Errno },
    #[error("node set is empty")]
    EmptyNodeSet,
    #[error("page and node arrays differ in length ({pages} vs {nodes})")]
    LengthMismatch { pages: usize, nodes: usize },
}

impl NumaError {
    /// True when the range vanished from the address space between the
    /// caller's snapshot and the syscall.
    pub fn is_stale_range(&self) -> bool {
        matches!(
            self,
            NumaError::BindFailed { errno: Errno::EFAULT | Errno::ENOMEM, .. }
        )
    }
}

/// Memory policy applied by a binding operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemPolicy {
    /// Pages may only live on the given nodes.
    Bind,
    /// Pages are spread round-robin across the given nodes.
    Interleave,
}

impl MemPolicy {
    fn mode(self) -> c_int {
        match self {
            MemPolicy::Bind => MPOL_BIND,
            MemPolicy::Interleave => MPOL_INTERLEAVE,
        }
    }
}

/// Kernel NUMA control primitives consumed by the placement engine.
pub trait NumaBackend: Send + Sync {
    /// Binds `[addr, addr + len)` to `nodes`, moving resident pages now and
    /// failing if any page cannot be placed.
    fn bind(&self, addr: usize, len: usize, policy: MemPolicy, nodes: &NodeSet) -> Result<(), NumaError>;

    /// Migrates each page in `pages` to the matching entry of `nodes`.
    /// Per-page results land in `status` (node id or negative errno).
    fn move_pages(&self, pages: &[usize], nodes: &[c_int], status: &mut [c_int]) -> Result<(), NumaError>;
}

/// Direct-syscall backend. Deliberately bypasses libnuma so the interposed
/// `mbind` symbol never sees our own calls.
pub struct LinuxNuma;

impl NumaBackend for LinuxNuma {
    fn bind(&self, addr: usize, len: usize, policy: MemPolicy, nodes: &NodeSet) -> Result<(), NumaError> {
        if nodes.is_empty() {
            return Err(NumaError::EmptyNodeSet);
        }
        let (mask, maxnode) = nodes.as_mask();
        trace!("mbind({:#x}, {}, {:?}, {:?}, MOVE|STRICT)", addr, len, policy, nodes);

        // SAFETY: mbind only inspects the range and reads `maxnode - 1` bits
        // from `mask`, which covers exactly that many bits.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr as *mut c_void,
                len as c_ulong,
                policy.mode() as c_long,
                mask.as_ptr(),
                maxnode,
                MPOL_MF_MOVE | MPOL_MF_STRICT,
            )
        };

        if ret != 0 {
            return Err(NumaError::BindFailed {
                addr,
                len,
                policy,
                nodes: nodes.clone(),
                errno: Errno::last(),
            });
        }
        Ok(())
    }

    fn move_pages(&self, pages: &[usize], nodes: &[c_int], status: &mut [c_int]) -> Result<(), NumaError> {
        if pages.len() != nodes.len() || pages.len() != status.len() {
            return Err(NumaError::LengthMismatch { pages: pages.len(), nodes: nodes.len() });
        }
        if pages.is_empty() {
            return Ok(());
        }

        // SAFETY: all three arrays hold `pages.len()` elements; `usize` has
        // the layout of `void *` on every Linux target.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0 as c_int,
                pages.len() as c_ulong,
                pages.as_ptr() as *const *const c_void,
                nodes.as_ptr(),
                status.as_mut_ptr(),
                MPOL_MF_MOVE as c_int,
            )
        };

        if ret < 0 {
            return Err(NumaError::MoveFailed { pages: pages.len(), errno: Errno::last() });
        }
        Ok(())
    }
}
