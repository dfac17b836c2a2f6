use log::info;

use super::StrategySettings;
use crate::error::Result;
use crate::search::{shift_schedule, weighted_walk, ControllerStatus, Probe, WalkOutcome};

pub(super) fn print_parameters(settings: &StrategySettings) {
    settings.print_search();
    info!("NUMAFLUX_FLAT_THRESHOLD:       {}", settings.flat_threshold);
    info!("NUMAFLUX_PLACE_ON_ADDITION:    {}", settings.place_on_addition);
}

/// Shifts never exceed the non-worker weight.
pub(super) fn run<P: Probe>(
    probe: &mut P,
    max_shift: f64,
    settings: &StrategySettings,
    status: &ControllerStatus,
) -> Result<WalkOutcome> {
    let schedule = shift_schedule(max_shift);
    weighted_walk(probe, &schedule, settings.search_params(), settings.flat_threshold, status)
}
