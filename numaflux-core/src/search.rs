//! Hill-climbing over placement distributions.
//!
//! Both walks step through candidate distributions in a fixed order, keep
//! the best stall rate seen so far and stop once a regression past
//! [`TOLERANCE`] survives a second, larger measurement.

use crossbeam_utils::atomic::AtomicCell;
use log::info;

use crate::error::Result;
use crate::placement::Distribution;
use crate::weights::round_to;

/// A sample worse than `best * TOLERANCE` counts as a regression.
pub const TOLERANCE: f64 = 1.001;

/// Distance between candidate ratios or shifts, in percentage points.
pub const STEP: u32 = 10;

/// What a walk needs from the running system.
pub trait Probe {
    /// Discards the transient first reading and waits for the workload to
    /// settle.
    fn warm_up(&mut self) -> Result<()>;
    /// Applies `distribution` to the whole address space and lets it settle.
    fn apply(&mut self, distribution: Distribution) -> Result<()>;
    /// Averaged stall rate over `polls` samples minus `trim` at each end.
    fn measure(&mut self, polls: usize, trim: usize) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    pub polls: usize,
    pub trim: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every candidate was evaluated.
    Exhausted,
    /// A regression was confirmed.
    Regression,
    /// Consecutive samples stopped changing.
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkOutcome {
    /// Ratio or shift, in percent, at which the walk stopped.
    pub final_step: f64,
    pub final_sample: f64,
    pub best_step: f64,
    pub best_sample: f64,
    pub reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    WarmingUp,
    Searching,
    Done,
}

/// Progress of the controller, readable from any thread without locking.
pub struct ControllerStatus {
    pub phase: AtomicCell<Phase>,
    pub current_step: AtomicCell<f64>,
    pub current_sample: AtomicCell<f64>,
    pub best_step: AtomicCell<f64>,
    pub best_sample: AtomicCell<f64>,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            phase: AtomicCell::new(Phase::Idle),
            current_step: AtomicCell::new(f64::NAN),
            current_sample: AtomicCell::new(f64::INFINITY),
            best_step: AtomicCell::new(f64::NAN),
            best_sample: AtomicCell::new(f64::INFINITY),
        }
    }
}

impl ControllerStatus {
    pub fn print(&self, mode: &str) {
        info!(
            "[{}] {:?}: at {:.1}% stall rate {:.10}, best {:.10} at {:.1}%",
            mode,
            self.phase.load(),
            self.current_step.load(),
            self.current_sample.load(),
            self.best_sample.load(),
            self.best_step.load()
        );
    }

    pub(crate) fn record(&self, step: f64, sample: f64, best_step: f64, best_sample: f64) {
        self.current_step.store(step);
        self.current_sample.store(sample);
        self.best_step.store(best_step);
        self.best_sample.store(best_sample);
    }
}

/// Candidate local percentages: the first multiple of 5 at or above the
/// even split, in steps of 10, keeping only values off the 10-grid and 100.
pub fn ratio_schedule(nodes: usize) -> Vec<u32> {
    let nodes = nodes.max(1) as u32;
    let start = (100 / nodes + 4) / 5 * 5;
    (start..=100)
        .step_by(STEP as usize)
        .filter(|p| p % 10 != 0 || *p == 100)
        .collect()
}

/// Shifts 0, 10, .. up to `max_shift`.
pub fn shift_schedule(max_shift: f64) -> Vec<u32> {
    let max = max_shift.clamp(0.0, 100.0).floor() as u32;
    (0..=max).step_by(STEP as usize).collect()
}

struct BestSoFar {
    best: f64,
    best_step: f64,
}

impl BestSoFar {
    fn new() -> Self {
        Self { best: f64::INFINITY, best_step: f64::NAN }
    }

    fn observe(&mut self, step: f64, sample: f64) {
        if sample < self.best {
            self.best = sample;
            self.best_step = step;
        }
    }

    fn regressed(&self, sample: f64) -> bool {
        sample > self.best * TOLERANCE
    }
}

fn confirm_regression<P: Probe>(probe: &mut P, params: SearchParams, best: f64) -> Result<bool> {
    info!("Stall rate went up. Is this the best we can do?");
    let confirmation = probe.measure(params.polls * 2, params.trim * 2)?;
    let confirmed = confirmation > best * TOLERANCE;
    if confirmed {
        info!("Confirmed ({:.10} > {:.10}).", confirmation, best * TOLERANCE);
    } else {
        info!("Transient ({:.10}), carrying on.", confirmation);
    }
    Ok(confirmed)
}

/// Walks the local ratio through `schedule` (percentages). Stops where the
/// regression was confirmed without re-applying the best ratio.
pub fn ratio_walk<P: Probe>(
    probe: &mut P,
    schedule: &[u32],
    params: SearchParams,
    status: &ControllerStatus,
) -> Result<WalkOutcome> {
    status.phase.store(Phase::WarmingUp);
    probe.warm_up()?;
    status.phase.store(Phase::Searching);

    let mut seen = BestSoFar::new();
    let mut previous = f64::INFINITY;
    let mut outcome = None;
    let mut last = (f64::NAN, f64::INFINITY);

    for &pct in schedule {
        let ratio = pct as f64 / 100.0;
        info!("Checking a ratio of {:.1}%", pct as f64);
        probe.apply(Distribution::Ratio(ratio))?;
        let sample = probe.measure(params.polls, params.trim)?;
        info!(
            "Ratio: {:.2} StallRate: {:.10} (previous {:.10}; best {:.10})",
            ratio, sample, previous, seen.best
        );

        seen.observe(pct as f64, sample);
        status.record(pct as f64, sample, seen.best_step, seen.best);
        last = (pct as f64, sample);

        if seen.regressed(sample) && confirm_regression(probe, params, seen.best)? {
            outcome = Some(StopReason::Regression);
            break;
        }
        previous = sample;
    }

    Ok(finish(status, last, &seen, outcome.unwrap_or(StopReason::Exhausted)))
}

/// Walks the shift through `schedule`. Shift 0 is measured as found. A
/// confirmed regression rewinds to the previous shift before stopping; a
/// flat signal stops straight away.
pub fn weighted_walk<P: Probe>(
    probe: &mut P,
    schedule: &[u32],
    params: SearchParams,
    flat_threshold: f64,
    status: &ControllerStatus,
) -> Result<WalkOutcome> {
    status.phase.store(Phase::WarmingUp);
    probe.warm_up()?;
    status.phase.store(Phase::Searching);

    let mut seen = BestSoFar::new();
    let mut previous: Option<(f64, f64)> = None;
    let mut outcome = None;
    let mut last = (f64::NAN, f64::INFINITY);

    for &shift in schedule {
        let shift = shift as f64;
        info!("Checking a shift of {:.1}%", shift);
        if shift != 0.0 {
            probe.apply(Distribution::Shift(shift))?;
        }
        let sample = probe.measure(params.polls, params.trim)?;
        info!(
            "Shift: {:.1} StallRate: {:.10} (previous {:.10}; best {:.10})",
            shift,
            sample,
            previous.map_or(f64::INFINITY, |p| p.1),
            seen.best
        );

        seen.observe(shift, sample);
        status.record(shift, sample, seen.best_step, seen.best);
        last = (shift, sample);

        if seen.regressed(sample) && confirm_regression(probe, params, seen.best)? {
            if let Some((prev_shift, prev_sample)) = previous {
                info!("Rewinding to a shift of {:.1}%", prev_shift);
                probe.apply(Distribution::Shift(prev_shift))?;
                last = (prev_shift, prev_sample);
                status.record(prev_shift, prev_sample, seen.best_step, seen.best);
            }
            outcome = Some(StopReason::Regression);
            break;
        }

        if let Some((_, prev_sample)) = previous {
            if (round_to(sample, 2) - round_to(prev_sample, 2)).abs() < flat_threshold {
                info!("Stall rate flattened out.");
                outcome = Some(StopReason::Flat);
                break;
            }
        }
        previous = Some((shift, sample));
    }

    Ok(finish(status, last, &seen, outcome.unwrap_or(StopReason::Exhausted)))
}

fn finish(status: &ControllerStatus, last: (f64, f64), seen: &BestSoFar, reason: StopReason) -> WalkOutcome {
    status.phase.store(Phase::Done);
    let outcome = WalkOutcome {
        final_step: last.0,
        final_sample: last.1,
        best_step: seen.best_step,
        best_sample: seen.best,
        reason,
    };
    info!("My work here is done! ({:?})", reason);
    info!("Final: {:.1}%", outcome.final_step);
    info!("Stall Rate: {:.10}", outcome.final_sample);
    info!("Best Measured Stall Rate: {:.10} at {:.1}%", outcome.best_sample, outcome.best_step);
    outcome
}
