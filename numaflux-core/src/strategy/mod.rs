//! Placement strategies.
//!
//! The set of modes is closed; [`Mode::from_str`] is the factory keyed by
//! name and [`Strategy`] dispatches on the variant.

mod adaptive;
mod disabled;
mod fixed_ratio;
mod scan;
mod weighted;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::config::RuntimeConfig;
use crate::controller::{self, ControllerHandle};
use crate::error::{CoreError, Result};
use crate::estimator::StallRateEstimator;
use crate::placement::{Distribution, PlacementEngine};
use crate::search::{ControllerStatus, Probe, SearchParams};
use crate::segment::{MemorySegment, SegmentKind};
use crate::tracker::{SegmentObserver, SegmentTracker};

/// Segments above this size are placed with the node weights as soon as
/// they appear, in modes that do so.
pub const PLACE_ON_ADDITION_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Disabled,
    Fixed,
    Scan,
    Adaptive,
    WeightedAdaptive,
}

impl Mode {
    pub const ALL: [Mode; 5] = [Mode::Disabled, Mode::Fixed, Mode::Scan, Mode::Adaptive, Mode::WeightedAdaptive];

    pub fn name(self) -> &'static str {
        match self {
            Mode::Disabled => "disabled",
            Mode::Fixed => "fixed",
            Mode::Scan => "scan",
            Mode::Adaptive => "adaptive",
            Mode::WeightedAdaptive => "wadaptive",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Mode::Disabled => "Track memory but never move pages",
            Mode::Fixed => "Place every segment once at a fixed local ratio",
            Mode::Scan => "Sweep all weighted shifts and report the stall rate of each",
            Mode::Adaptive => "Search for the local ratio with the lowest stall rate",
            Mode::WeightedAdaptive => "Search for the weight shift with the lowest stall rate",
        }
    }

    /// Every mode but `disabled` samples the stall counters.
    pub fn needs_counters(self) -> bool {
        self != Mode::Disabled
    }
}

impl FromStr for Mode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.name() == s.trim())
            .ok_or_else(|| CoreError::UnknownMode(s.to_string()))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The numeric knobs the modes read.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub wait_start: Duration,
    pub polls: usize,
    pub trim: usize,
    pub poll_sleep: Duration,
    pub settle: Duration,
    pub local_ratio: f64,
    pub migrate_resident: bool,
    pub flat_threshold: f64,
    pub place_on_addition: bool,
    pub exit_when_finished: bool,
    pub monitor_core: Option<usize>,
}

impl StrategySettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            wait_start: config.wait_start(),
            polls: config.num_polls,
            trim: config.num_poll_outliers,
            poll_sleep: config.poll_sleep(),
            settle: config.settle(),
            local_ratio: config.local_ratio,
            migrate_resident: config.migrate_resident,
            flat_threshold: config.flat_threshold,
            place_on_addition: config.place_on_addition,
            exit_when_finished: config.exit_when_finished,
            monitor_core: config.monitor_core,
        }
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams { polls: self.polls, trim: self.trim }
    }

    fn print_sampling(&self) {
        info!("NUMAFLUX_NUM_POLLS:            {}", self.polls);
        info!("NUMAFLUX_NUM_POLL_OUTLIERS:    {}", self.trim);
        info!("NUMAFLUX_POLL_SLEEP:           {}", self.poll_sleep.as_micros());
    }

    /// The searching modes wait `wait_start` before their first placement.
    fn print_search(&self) {
        info!("NUMAFLUX_WAIT_START:           {}", self.wait_start.as_secs());
        self.print_sampling();
    }
}

/// Live system behind the search: the tracker's segments, the placement
/// engine and the stall counters.
pub struct LiveProbe {
    tracker: Arc<SegmentTracker>,
    engine: Arc<PlacementEngine>,
    estimator: StallRateEstimator,
    wait_start: Duration,
    settle: Duration,
    poll_sleep: Duration,
}

impl Probe for LiveProbe {
    fn warm_up(&mut self) -> Result<()> {
        self.estimator.sample()?;
        thread::sleep(self.wait_start);
        Ok(())
    }

    fn apply(&mut self, distribution: Distribution) -> Result<()> {
        let segments = self.tracker.segments();
        self.engine.place_all(&segments, distribution)?;
        thread::sleep(self.settle);
        Ok(())
    }

    fn measure(&mut self, polls: usize, trim: usize) -> Result<f64> {
        self.estimator.average(polls, self.poll_sleep, trim)
    }
}

/// One selected mode with everything it needs to run.
pub struct Strategy {
    mode: Mode,
    settings: StrategySettings,
    engine: Arc<PlacementEngine>,
    // Taken by the one and only controller run.
    estimator: Mutex<Option<StallRateEstimator>>,
    status: Arc<ControllerStatus>,
}

impl Strategy {
    pub fn new(
        mode: Mode,
        settings: StrategySettings,
        engine: Arc<PlacementEngine>,
        estimator: Option<StallRateEstimator>,
    ) -> Result<Self> {
        if mode.needs_counters() && estimator.is_none() {
            return Err(CoreError::Config(format!("mode '{}' needs stall counters", mode)));
        }
        Ok(Self {
            mode,
            settings,
            engine,
            estimator: Mutex::new(estimator),
            status: Arc::new(ControllerStatus::default()),
        })
    }

    /// Builds the strategy registered under `name`.
    pub fn by_name(
        name: &str,
        settings: StrategySettings,
        engine: Arc<PlacementEngine>,
        estimator: Option<StallRateEstimator>,
    ) -> Result<Self> {
        Self::new(name.parse()?, settings, engine, estimator)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> &Arc<ControllerStatus> {
        &self.status
    }

    pub fn engine(&self) -> &Arc<PlacementEngine> {
        &self.engine
    }

    pub fn print_parameters(&self) {
        info!("Mode '{}': {}", self.mode, self.mode.description());
        match self.mode {
            Mode::Disabled => {}
            Mode::Fixed => fixed_ratio::print_parameters(&self.settings),
            Mode::Scan => scan::print_parameters(&self.settings),
            Mode::Adaptive => adaptive::print_parameters(&self.settings),
            Mode::WeightedAdaptive => weighted::print_parameters(&self.settings),
        }
    }

    /// Launches the controller thread. A strategy runs at most once per
    /// process; later calls fail with [`CoreError::AlreadyStarted`].
    pub fn start(self: &Arc<Self>, tracker: Arc<SegmentTracker>) -> Result<Option<ControllerHandle>> {
        if self.mode == Mode::Disabled {
            disabled::start();
            return Ok(None);
        }

        let estimator = self
            .estimator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(CoreError::AlreadyStarted(self.mode.name()))?;

        let strategy = Arc::clone(self);
        let handle = controller::spawn(self.mode.name(), self.settings.monitor_core, move || {
            let mut probe = LiveProbe {
                tracker,
                engine: Arc::clone(&strategy.engine),
                estimator,
                wait_start: strategy.settings.wait_start,
                settle: strategy.settings.settle,
                poll_sleep: strategy.settings.poll_sleep,
            };
            strategy.run(&mut probe)
        })?;
        Ok(Some(handle))
    }

    /// The controller body of the selected mode.
    pub fn run<P: Probe>(&self, probe: &mut P) -> Result<()> {
        let status = &self.status;
        match self.mode {
            Mode::Disabled => Ok(()),
            Mode::Fixed => fixed_ratio::run(probe, &self.settings, status).map(drop),
            Mode::Adaptive => adaptive::run(probe, self.engine.node_count(), &self.settings, status).map(drop),
            Mode::WeightedAdaptive => weighted::run(probe, self.engine.max_shift(), &self.settings, status).map(drop),
            Mode::Scan => {
                scan::run(probe, self.engine.max_shift(), &self.settings, status)?;
                if self.settings.exit_when_finished {
                    info!("Scan finished, exiting");
                    std::process::exit(0);
                }
                Ok(())
            }
        }
    }

    fn places_on_addition(&self) -> bool {
        match self.mode {
            Mode::Scan => true,
            Mode::WeightedAdaptive => self.settings.place_on_addition,
            _ => false,
        }
    }
}

impl SegmentObserver for Strategy {
    fn segment_added(&self, segment: &MemorySegment) -> Result<()> {
        if !self.places_on_addition() || segment.kind() == SegmentKind::Text || segment.len() <= PLACE_ON_ADDITION_BYTES {
            return Ok(());
        }
        match self.engine.place_segment(segment, Distribution::Baseline) {
            Err(CoreError::Numa(e)) if e.is_stale_range() => {
                debug!("New segment {} vanished before placement", segment);
                Ok(())
            }
            other => other,
        }
    }

    fn segment_removed(&self, segment: &MemorySegment) -> Result<()> {
        debug!("Segment removed: {}", segment);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::estimator::tests::ScriptedCounters;
    use crate::placement::tests::{options, RecordingNuma};
    use crate::placement::PlacementOptions;
    use crate::search::tests::ScriptedProbe;
    use crate::search::Phase;
    use crate::weights::{NodeWeight, NodeWeightTable};
    use numaflux_io::NodeSet;

    pub(crate) fn settings() -> StrategySettings {
        StrategySettings {
            wait_start: Duration::ZERO,
            polls: 4,
            trim: 1,
            poll_sleep: Duration::ZERO,
            settle: Duration::ZERO,
            local_ratio: 0.8,
            migrate_resident: false,
            flat_threshold: 0.01,
            place_on_addition: false,
            exit_when_finished: false,
            monitor_core: None,
        }
    }

    pub(crate) fn engine(backend: Arc<RecordingNuma>, nodes: u32, opts: PlacementOptions) -> Arc<PlacementEngine> {
        let baseline = NodeWeightTable::new(vec![NodeWeight { node: 0, weight: 60.0 }, NodeWeight { node: 1, weight: 40.0 }]).unwrap();
        Arc::new(PlacementEngine::new(backend, NodeSet::first_n(nodes), NodeSet::single(0), baseline, opts).unwrap())
    }

    pub(crate) fn estimator() -> StallRateEstimator {
        StallRateEstimator::new(Box::new(ScriptedCounters::new(vec![10], 100))).unwrap()
    }

    #[test]
    fn test_factory_by_name() {
        for mode in Mode::ALL {
            assert_eq!(mode.name().parse::<Mode>().unwrap(), mode);
        }
        assert!(matches!("numa".parse::<Mode>(), Err(CoreError::UnknownMode(_))));

        let engine = engine(Arc::new(RecordingNuma::default()), 2, options());
        let strategy = Strategy::by_name("fixed", settings(), engine.clone(), Some(estimator())).unwrap();
        assert_eq!(strategy.mode(), Mode::Fixed);
        assert!(Strategy::by_name("adaptive", settings(), engine.clone(), None).is_err());
        assert!(Strategy::by_name("disabled", settings(), engine, None).is_ok());
    }

    #[test]
    fn test_fixed_mode_places_once_and_measures() {
        let engine = engine(Arc::new(RecordingNuma::default()), 2, options());
        let strategy = Strategy::new(Mode::Fixed, settings(), engine, Some(estimator())).unwrap();
        let mut probe = ScriptedProbe::new(&[0.25]);
        strategy.run(&mut probe).unwrap();
        // No warm-up: the placement happens as soon as the mode starts.
        assert!(!probe.warmed_up);
        assert_eq!(probe.applied, vec![Distribution::Ratio(0.8)]);
        assert_eq!(probe.measured, vec![(4, 1)]);
        assert_eq!(strategy.status().phase.load(), Phase::Done);
        assert_eq!(strategy.status().current_sample.load(), 0.25);
    }

    #[test]
    fn test_fixed_mode_can_migrate_resident_pages() {
        let backend = Arc::new(RecordingNuma::default());
        let engine = engine(backend.clone(), 2, options());
        let settings = StrategySettings { migrate_resident: true, ..settings() };
        let strategy = Strategy::new(Mode::Fixed, settings, engine.clone(), Some(estimator())).unwrap();

        let mut probe = ScriptedProbe::new(&[0.25]);
        strategy.run(&mut probe).unwrap();
        assert_eq!(probe.applied.len(), 1);
        let Distribution::Migrate(remote_pct) = probe.applied[0] else {
            panic!("expected a migration, got {:?}", probe.applied[0]);
        };
        assert!((remote_pct - 20.0).abs() < 1e-9);

        // Through the engine, a fifth of the pages go to the non-worker node.
        let segment = MemorySegment::with_len(0x40_0000, 10 * 4096, SegmentKind::Mmap);
        engine.place_segment(&segment, probe.applied[0]).unwrap();
        let (_, targets) = backend.moves.lock().unwrap().pop().unwrap();
        assert_eq!(targets.iter().filter(|&&node| node == 1).count(), 2);
        assert!(backend.binds().is_empty());
    }

    #[test]
    fn test_adaptive_mode_walks_the_node_schedule() {
        let engine = engine(Arc::new(RecordingNuma::default()), 2, options());
        let strategy = Strategy::new(Mode::Adaptive, settings(), engine, Some(estimator())).unwrap();
        let mut probe = ScriptedProbe::new(&[0.3]);
        strategy.run(&mut probe).unwrap();
        // Two nodes leave a single candidate.
        assert_eq!(probe.applied, vec![Distribution::Ratio(1.0)]);
        assert_eq!(strategy.status().best_step.load(), 100.0);
    }

    #[test]
    fn test_weighted_mode_is_bounded_by_non_worker_weight() {
        let engine = engine(Arc::new(RecordingNuma::default()), 2, options());
        let strategy = Strategy::new(Mode::WeightedAdaptive, settings(), engine, Some(estimator())).unwrap();
        let mut probe = ScriptedProbe::new(&[0.9, 0.8, 0.7, 0.6, 0.5]);
        strategy.run(&mut probe).unwrap();
        assert_eq!(probe.applied.last(), Some(&Distribution::Shift(40.0)));
        assert_eq!(probe.applied.len(), 4);
    }

    #[test]
    fn test_scan_mode_measures_every_shift() {
        let engine = engine(Arc::new(RecordingNuma::default()), 2, options());
        let strategy = Strategy::new(Mode::Scan, settings(), engine, Some(estimator())).unwrap();
        let mut probe = ScriptedProbe::new(&[0.5, 0.9, 0.1, 0.4, 0.3]);
        strategy.run(&mut probe).unwrap();
        assert_eq!(probe.applied.len(), 5);
        assert_eq!(probe.applied[0], Distribution::Shift(0.0));
        assert_eq!(strategy.status().best_step.load(), 20.0);
    }

    #[test]
    fn test_scan_places_large_segments_on_addition() {
        let backend = Arc::new(RecordingNuma::default());
        let engine = engine(backend.clone(), 2, options());
        let strategy = Strategy::new(Mode::Scan, settings(), engine, Some(estimator())).unwrap();

        strategy.segment_added(&MemorySegment::with_len(0x10_0000, 1 << 20, SegmentKind::Malloc)).unwrap();
        assert!(backend.binds().is_empty());
        strategy.segment_added(&MemorySegment::with_len(0x40_0000, 4 << 20, SegmentKind::Mmap)).unwrap();
        let per_node = backend.pages_per_node();
        assert_eq!(per_node[&0] + per_node[&1], (4 << 20) / 4096);
        // 40% on node 1, give or take the page rounding of the first chunk.
        assert!((per_node[&1] as f64 / 1024.0 - 0.4).abs() < 0.01);
    }

    #[test]
    fn test_adaptive_ignores_additions() {
        let backend = Arc::new(RecordingNuma::default());
        let strategy = Strategy::new(Mode::Adaptive, settings(), engine(backend.clone(), 2, options()), Some(estimator())).unwrap();
        strategy.segment_added(&MemorySegment::with_len(0x40_0000, 4 << 20, SegmentKind::Mmap)).unwrap();
        assert!(backend.binds().is_empty());
    }
}
