use std::mem;
use log::{info, warn};

/// Pins the current thread to a specific physical CPU core.
///
/// # Logic
/// Uses `libc::sched_setaffinity` to restrict the OS scheduler for this thread
/// to a single bit in the CPU mask. The controller thread is pinned this way
/// so its own sampling work stays off the cores it is measuring.
///
/// # Errors
/// Logs a warning if pinning fails (e.g., core index out of bounds).
/// It does NOT panic, allowing the controller to run "floating" if affinity is impossible.
pub fn pin_thread_to_core(core_id: usize) -> bool {
    if core_id >= libc::CPU_SETSIZE as usize {
        warn!("Core {} is beyond CPU_SETSIZE. Running floating.", core_id);
        return false;
    }

    // SAFETY: cpu_set_t is plain bits; all-zero is a valid empty set.
    let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(core_id, &mut cpu_set);
    }

    // SAFETY:
    // - `pid` 0 refers to the calling thread.
    // - `cpu_set` is stack-allocated and valid.
    let ret = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set) };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!("Failed to pin thread to core {}. Error: {} (Running floating)", core_id, err);
        return false;
    }

    info!("Controller thread pinned to core {}", core_id);
    true
}
