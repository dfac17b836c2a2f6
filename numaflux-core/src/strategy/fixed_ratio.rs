use log::info;

use super::StrategySettings;
use crate::error::Result;
use crate::placement::Distribution;
use crate::search::{ControllerStatus, Phase, Probe};

pub(super) fn print_parameters(settings: &StrategySettings) {
    info!("NUMAFLUX_LOCAL_RATIO:          {:.2}", settings.local_ratio);
    info!("NUMAFLUX_MIGRATE_RESIDENT:     {}", settings.migrate_resident);
    settings.print_sampling();
}

/// The layout the fixed mode applies: a rebinding split, or a migration of
/// the pages already resident when `migrate_resident` is set.
pub(super) fn distribution(settings: &StrategySettings) -> Distribution {
    if settings.migrate_resident {
        Distribution::Migrate((1.0 - settings.local_ratio) * 100.0)
    } else {
        Distribution::Ratio(settings.local_ratio)
    }
}

/// One placement pass at the configured ratio, right away, and one
/// averaged sample.
pub(super) fn run<P: Probe>(probe: &mut P, settings: &StrategySettings, status: &ControllerStatus) -> Result<f64> {
    let pct = settings.local_ratio * 100.0;
    status.phase.store(Phase::Searching);

    info!("Placing all segments at a local ratio of {:.1}%", pct);
    probe.apply(distribution(settings))?;
    let sample = probe.measure(settings.polls, settings.trim)?;
    info!("Ratio: {:.2} StallRate: {:.10}", settings.local_ratio, sample);

    status.record(pct, sample, pct, sample);
    status.phase.store(Phase::Done);
    Ok(sample)
}
