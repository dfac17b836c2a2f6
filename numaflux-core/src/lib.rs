//! NUMAflux core: address-space tracking, page placement and the adaptive
//! stall-rate search.
//!
//! Construction order is explicit. A [`Strategy`] is built first, the
//! [`SegmentTracker`] is built with that strategy as its observer, and the
//! strategy is started last with a handle to the tracker. [`Runtime`] wires
//! the three together from a [`RuntimeConfig`].

pub mod error;
pub mod config;
pub mod segment;
pub mod tracker;
pub mod weights;
pub mod placement;
pub mod estimator;
pub mod search;
pub mod strategy;
pub mod controller;
pub mod runtime;
pub mod hook;

pub use error::{escalate, terminate, CoreError, Result};
pub use config::RuntimeConfig;
pub use segment::{MemorySegment, SegmentKind};
pub use tracker::{AllocPrimitives, SegmentObserver, SegmentTracker};
pub use weights::{NodeWeight, NodeWeightTable};
pub use placement::{Distribution, PlacementEngine, PlacementOptions};
pub use estimator::{trimmed_mean, StallRateEstimator};
pub use search::{ControllerStatus, Probe, SearchParams, StopReason, WalkOutcome};
pub use strategy::{Mode, Strategy, StrategySettings};
pub use controller::ControllerHandle;
pub use runtime::Runtime;
pub use hook::{BootstrapArena, ReentryGuard};
