use super::StrategySettings;
use crate::error::Result;
use crate::search::{ratio_schedule, ratio_walk, ControllerStatus, Probe, WalkOutcome};

pub(super) fn print_parameters(settings: &StrategySettings) {
    settings.print_search();
}

pub(super) fn run<P: Probe>(
    probe: &mut P,
    node_count: usize,
    settings: &StrategySettings,
    status: &ControllerStatus,
) -> Result<WalkOutcome> {
    let schedule = ratio_schedule(node_count);
    ratio_walk(probe, &schedule, settings.search_params(), status)
}
