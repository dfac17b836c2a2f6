use std::fs;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::str::FromStr;

use libc::{c_int, c_ulong, c_void, pid_t};
use log::{debug, info};
use nix::errno::Errno;
use thiserror::Error;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_RAW: u32 = 4;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;

// perf_event_attr flag bits
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_INHERIT: u64 = 1 << 1;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// _IO('$', n)
const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;

const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("perf_event_open for {event} failed: {errno} (perf_event_paranoid={paranoid})")]
    Unavailable { event: &'static str, errno: Errno, paranoid: i32 },
    #[error("failed to read {event} counter: {errno}")]
    ReadFailed { event: &'static str, errno: Errno },
    #[error("failed to toggle counters: {0}")]
    ControlFailed(Errno),
    #[error("unknown stall event '{0}' (expected backend, frontend or a hex raw config)")]
    UnknownEvent(String),
}

/// Raw values of the two free-running counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterReading {
    pub cycles: u64,
    pub stalls: u64,
}

/// Which hardware event counts as a "stall".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEvent {
    BackendStalls,
    FrontendStalls,
    Raw(u64),
}

impl CounterEvent {
    fn type_and_config(self) -> (u32, u64) {
        match self {
            CounterEvent::BackendStalls => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
            CounterEvent::FrontendStalls => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
            CounterEvent::Raw(config) => (PERF_TYPE_RAW, config),
        }
    }
}

impl FromStr for CounterEvent {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "backend" => Ok(CounterEvent::BackendStalls),
            "frontend" => Ok(CounterEvent::FrontendStalls),
            raw => raw
                .strip_prefix("0x")
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .map(CounterEvent::Raw)
                .ok_or_else(|| CounterError::UnknownEvent(s.to_string())),
        }
    }
}

/// Hardware counter access used by the stall-rate estimator.
///
/// Counters are free-running between `start` and `stop`; `read` may be
/// called in either state.
pub trait CounterBackend: Send {
    fn start(&mut self) -> Result<(), CounterError>;
    fn stop(&mut self) -> Result<(), CounterError>;
    fn read(&mut self) -> Result<CounterReading, CounterError>;
}

/// `struct perf_event_attr`, PERF_ATTR_SIZE_VER5 layout.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

/// Linux perf-event counters covering the calling thread and every thread
/// it creates afterwards.
///
/// Open this from the main thread before the application spawns workers,
/// otherwise the inherited counters miss them.
pub struct PerfCounters {
    cycles: OwnedFd,
    stalls: OwnedFd,
}

impl PerfCounters {
    pub fn open(event: CounterEvent) -> Result<Self, CounterError> {
        let cycles = open_counter("cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES)?;
        let (kind, config) = event.type_and_config();
        let stalls = open_counter("stalls", kind, config)?;
        info!("Stall counters opened ({:?}, inherited by new threads)", event);
        Ok(Self { cycles, stalls })
    }

    fn ioctl_all(&self, request: c_ulong) -> Result<(), CounterError> {
        for fd in [&self.cycles, &self.stalls] {
            // SAFETY: fd is an open perf event descriptor owned by self.
            let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, 0 as c_int) };
            if ret != 0 {
                return Err(CounterError::ControlFailed(Errno::last()));
            }
        }
        Ok(())
    }
}

impl CounterBackend for PerfCounters {
    fn start(&mut self) -> Result<(), CounterError> {
        self.ioctl_all(PERF_EVENT_IOC_ENABLE)
    }

    fn stop(&mut self) -> Result<(), CounterError> {
        self.ioctl_all(PERF_EVENT_IOC_DISABLE)
    }

    fn read(&mut self) -> Result<CounterReading, CounterError> {
        Ok(CounterReading {
            cycles: read_counter("cycles", &self.cycles)?,
            stalls: read_counter("stalls", &self.stalls)?,
        })
    }
}

fn open_counter(event: &'static str, kind: u32, config: u64) -> Result<OwnedFd, CounterError> {
    let attr = PerfEventAttr {
        kind,
        size: mem::size_of::<PerfEventAttr>() as u32,
        config,
        flags: ATTR_DISABLED | ATTR_INHERIT | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
        ..Default::default()
    };

    // SAFETY: attr is a fully initialised perf_event_attr of the size it declares.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const PerfEventAttr,
            0 as pid_t,
            -1 as c_int,
            -1 as c_int,
            PERF_FLAG_FD_CLOEXEC,
        )
    };

    if fd < 0 {
        return Err(CounterError::Unavailable {
            event,
            errno: Errno::last(),
            paranoid: perf_event_paranoid(),
        });
    }
    debug!("perf_event_open({}) -> fd {}", event, fd);

    // SAFETY: the kernel just handed us this descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as c_int) })
}

fn read_counter(event: &'static str, fd: &OwnedFd) -> Result<u64, CounterError> {
    let mut value: u64 = 0;
    // SAFETY: reading exactly 8 bytes into a u64 on the stack.
    let n = unsafe { libc::read(fd.as_raw_fd(), &mut value as *mut u64 as *mut c_void, mem::size_of::<u64>()) };
    if n != mem::size_of::<u64>() as isize {
        return Err(CounterError::ReadFailed { event, errno: Errno::last() });
    }
    Ok(value)
}

/// Kernel restriction level for perf events (2 when unreadable).
pub fn perf_event_paranoid() -> i32 {
    fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(2)
}
