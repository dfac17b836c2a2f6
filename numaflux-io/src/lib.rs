//! NUMAflux I/O: the Hardware Abstraction Layer (HAL).
//!
//! Everything that talks to the kernel lives here: NUMA binding and page
//! migration syscalls, perf-event stall counters, the process memory map,
//! the original libc allocation symbols and the machine topology.
//! The core crate only sees the traits exported from this crate.

pub mod platform;
pub mod memory;
pub mod numa;
pub mod perf;
pub mod maps;
pub mod real;

// Re-exports for easier access by numaflux-core
pub use memory::{align_down, align_up, page_size, NodeSet};
pub use numa::{LinuxNuma, MemPolicy, NumaBackend, NumaError};
pub use perf::{CounterBackend, CounterError, CounterEvent, CounterReading, PerfCounters};
pub use maps::{AddressSpaceSource, ImageBounds, MapEntry, MapsError, ProcSelfMaps};
pub use real::{RealFunctions, SymbolError};
pub use platform::affinity;
pub use platform::topology::NumaTopology;
