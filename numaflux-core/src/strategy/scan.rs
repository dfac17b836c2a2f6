use log::info;

use super::StrategySettings;
use crate::error::Result;
use crate::placement::Distribution;
use crate::search::{shift_schedule, ControllerStatus, Phase, Probe};

pub(super) fn print_parameters(settings: &StrategySettings) {
    settings.print_search();
    info!(
        "NUMAFLUX_EXIT_WHEN_FINISHED:   {}",
        if settings.exit_when_finished { "Yes" } else { "No" }
    );
}

/// Measures every shift from 0 up to `max_shift` without stopping early.
pub(super) fn run<P: Probe>(
    probe: &mut P,
    max_shift: f64,
    settings: &StrategySettings,
    status: &ControllerStatus,
) -> Result<Vec<(f64, f64)>> {
    status.phase.store(Phase::WarmingUp);
    probe.warm_up()?;
    status.phase.store(Phase::Searching);

    let mut results = Vec::new();
    let (mut best_step, mut best) = (f64::NAN, f64::INFINITY);
    let mut previous = f64::INFINITY;

    for shift in shift_schedule(max_shift) {
        let shift = shift as f64;
        info!("Checking a shift of {:.1}%", shift);
        probe.apply(Distribution::Shift(shift))?;
        let sample = probe.measure(settings.polls, settings.trim)?;
        info!(
            "Shift: {:.1} StallRate: {:.10} (previous {:.10}; best {:.10})",
            shift, sample, previous, best
        );
        if sample < best {
            best = sample;
            best_step = shift;
        }
        status.record(shift, sample, best_step, best);
        results.push((shift, sample));
        previous = sample;
    }

    status.phase.store(Phase::Done);
    info!("Scan done. Best Measured Stall Rate: {:.10} at {:.1}%", best, best_step);
    Ok(results)
}
