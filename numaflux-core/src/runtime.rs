use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use numaflux_io::{
    AddressSpaceSource, CounterBackend, ImageBounds, LinuxNuma, NumaBackend, NumaTopology, PerfCounters,
    ProcSelfMaps,
};

use crate::config::RuntimeConfig;
use crate::controller::ControllerHandle;
use crate::error::{CoreError, Result};
use crate::estimator::StallRateEstimator;
use crate::placement::{PlacementEngine, PlacementOptions};
use crate::strategy::{Strategy, StrategySettings};
use crate::tracker::{AllocPrimitives, SegmentTracker};
use crate::weights::NodeWeightTable;

/// The process-wide services, built once in a fixed order: placement
/// engine and strategy first, then the tracker reporting to the strategy.
/// The controller only exists after [`Runtime::start`].
pub struct Runtime {
    config: RuntimeConfig,
    strategy: Arc<Strategy>,
    tracker: Arc<SegmentTracker>,
    controller: Mutex<Option<ControllerHandle>>,
}

impl Runtime {
    /// Builds against the live system: sysfs, the NUMA syscalls, perf
    /// counters and `/proc/self/maps`.
    pub fn live(config: RuntimeConfig, primitives: Arc<dyn AllocPrimitives>) -> Result<Self> {
        let topology = NumaTopology::detect();

        let counters: Option<Box<dyn CounterBackend>> = if config.mode.needs_counters() {
            Some(Box::new(PerfCounters::open(config.stall_event)?))
        } else {
            None
        };

        let maps = ProcSelfMaps;
        let regions = maps.regions()?;
        let bounds = ImageBounds::discover(&regions).ok_or(CoreError::MissingSegment("text"))?;

        Self::build(config, primitives, Arc::new(LinuxNuma), &maps, bounds, counters, topology)
    }

    pub fn build(
        config: RuntimeConfig,
        primitives: Arc<dyn AllocPrimitives>,
        numa: Arc<dyn NumaBackend>,
        maps: &dyn AddressSpaceSource,
        bounds: ImageBounds,
        counters: Option<Box<dyn CounterBackend>>,
        topology: NumaTopology,
    ) -> Result<Self> {
        topology.validate_workers(&config.workers)?;
        let all_nodes = topology.all_nodes();

        let baseline = match &config.weights {
            Some(path) => NodeWeightTable::load(path)?,
            None => NodeWeightTable::uniform(&all_nodes)?,
        };
        baseline.check_nodes(&all_nodes)?;
        debug!("Baseline weights:\n{}", baseline);

        let options = PlacementOptions {
            min_segment_bytes: config.min_segment,
            rebind_interleaved: config.rebind_interleaved,
            page_size: topology.page_size(),
        };
        let engine = Arc::new(PlacementEngine::new(numa, all_nodes, config.workers.clone(), baseline, options)?);

        let estimator = counters.map(StallRateEstimator::new).transpose()?;
        let settings = StrategySettings::from_config(&config);
        let strategy = Arc::new(Strategy::new(config.mode, settings, engine, estimator)?);

        let tracker = Arc::new(SegmentTracker::new(primitives, strategy.clone(), maps, bounds)?);
        info!("numaflux ready: mode '{}', {} segments tracked", config.mode, tracker.len());

        Ok(Self { config, strategy, tracker, controller: Mutex::new(None) })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn strategy(&self) -> &Arc<Strategy> {
        &self.strategy
    }

    pub fn tracker(&self) -> &Arc<SegmentTracker> {
        &self.tracker
    }

    /// Starts the selected strategy. A second call fails with
    /// [`CoreError::AlreadyStarted`].
    pub fn start(&self) -> Result<()> {
        self.config.print();
        self.strategy.print_parameters();
        if let Some(handle) = self.strategy.start(self.tracker.clone())? {
            *self.controller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.controller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Gives the controller up to the configured grace period to finish.
    pub fn shutdown(&self) {
        let handle = self.controller.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let name = handle.name();
            if !handle.wait(self.config.shutdown_grace()) {
                warn!("Controller '{}' did not finish in time; leaving it behind", name);
            }
        }
    }

    pub fn print_memory(&self) {
        self.tracker.print();
    }

    pub fn print_status(&self) {
        self.strategy.status().print(self.strategy.mode().name());
    }
}
