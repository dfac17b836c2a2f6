use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, CommandFactory, Parser};
use log::{info, LevelFilter};
use numaflux_io::{CounterEvent, NodeSet};

use crate::error::{CoreError, Result};
use crate::strategy::Mode;

/// Runtime options. The preload library reads them from `NUMAFLUX_*`
/// environment variables only; the launcher also accepts them as flags.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "numaflux",
    about = "Adaptive NUMA page placement",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct RuntimeConfig {
    /// Print all options and exit
    #[arg(long, env = "NUMAFLUX_HELP", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub print_options: bool,

    /// Placement strategy: disabled, fixed, scan, adaptive or wadaptive
    #[arg(long, env = "NUMAFLUX_MODE", default_value = "wadaptive")]
    pub mode: Mode,

    /// Start the strategy when the library is loaded
    #[arg(long, env = "NUMAFLUX_AUTOSTART", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub autostart: bool,

    /// Log filter: trace, debug, info, warn, error or off
    #[arg(long, env = "NUMAFLUX_LOGLEVEL", default_value = "info")]
    pub log_level: String,

    /// Time (in seconds) to wait before starting the search
    #[arg(long, env = "NUMAFLUX_WAIT_START", default_value_t = 2)]
    pub wait_start: u64,

    /// How many measurements to make for each candidate
    #[arg(long, env = "NUMAFLUX_NUM_POLLS", default_value_t = 20)]
    pub num_polls: usize,

    /// How many of the top-N and bottom-N measurements to discard
    #[arg(long, env = "NUMAFLUX_NUM_POLL_OUTLIERS", default_value_t = 5)]
    pub num_poll_outliers: usize,

    /// Time (in microseconds) between measurements
    #[arg(long, env = "NUMAFLUX_POLL_SLEEP", default_value_t = 200_000)]
    pub poll_sleep: u64,

    /// Time (in microseconds) to let a placement pass settle
    #[arg(long, env = "NUMAFLUX_SETTLE", default_value_t = 200_000)]
    pub settle: u64,

    /// Local ratio applied by the fixed mode
    #[arg(long, env = "NUMAFLUX_LOCAL_RATIO", default_value_t = 1.0)]
    pub local_ratio: f64,

    /// Fixed mode: move resident pages with move_pages instead of rebinding
    #[arg(long, env = "NUMAFLUX_MIGRATE_RESIDENT", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub migrate_resident: bool,

    /// Comma-separated worker node ids
    #[arg(long, env = "NUMAFLUX_WORKERS", default_value = "0", value_parser = parse_node_list)]
    pub workers: NodeSet,

    /// Node weight file, one `weight node-id` pair per line
    #[arg(long, env = "NUMAFLUX_WEIGHTS")]
    pub weights: Option<PathBuf>,

    /// Segments this size (in bytes) or smaller are left alone
    #[arg(long, env = "NUMAFLUX_MIN_SEGMENT", default_value_t = 1 << 20)]
    pub min_segment: usize,

    /// Rebind the interleaved part of a ratio placement across all nodes
    #[arg(long, env = "NUMAFLUX_REBIND_INTERLEAVED", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub rebind_interleaved: bool,

    /// Stop the weighted search once consecutive samples differ by less
    #[arg(long, env = "NUMAFLUX_FLAT_THRESHOLD", default_value_t = 0.01)]
    pub flat_threshold: f64,

    /// Stall event: backend, frontend, or a raw hex config such as 0x01a2
    #[arg(long, env = "NUMAFLUX_STALL_EVENT", default_value = "backend")]
    pub stall_event: CounterEvent,

    /// Pin the controller thread to this core
    #[arg(long, env = "NUMAFLUX_MONITOR_CORE")]
    pub monitor_core: Option<usize>,

    /// Weighted modes: place new segments with the node weights right away
    #[arg(long, env = "NUMAFLUX_PLACE_ON_ADDITION", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub place_on_addition: bool,

    /// Scan mode: exit the process after the sweep
    #[arg(long, env = "NUMAFLUX_EXIT_WHEN_FINISHED", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub exit_when_finished: bool,

    /// How long (in milliseconds) unloading waits for the controller
    #[arg(long, env = "NUMAFLUX_SHUTDOWN_GRACE_MS", default_value_t = 0)]
    pub shutdown_grace_ms: u64,
}

impl RuntimeConfig {
    /// Reads the environment only; command-line arguments belong to the
    /// host program.
    pub fn from_env() -> Result<Self> {
        Self::try_parse_from(["numaflux"])
            .map_err(|e| CoreError::Config(e.to_string()))?
            .validated()
    }

    pub fn validated(self) -> Result<Self> {
        if self.num_poll_outliers.saturating_mul(2) >= self.num_polls {
            return Err(CoreError::TrimTooLarge { samples: self.num_polls, trim: self.num_poll_outliers });
        }
        if !(0.0..=1.0).contains(&self.local_ratio) {
            return Err(CoreError::RatioOutOfRange(self.local_ratio));
        }
        if self.workers.is_empty() {
            return Err(CoreError::Config("NUMAFLUX_WORKERS names no nodes".into()));
        }
        self.level_filter()?;
        Ok(self)
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse()
            .map_err(|_| CoreError::Config(format!("unknown log level '{}'", self.log_level)))
    }

    pub fn help_text() -> String {
        Self::command().render_long_help().to_string()
    }

    pub fn wait_start(&self) -> Duration {
        Duration::from_secs(self.wait_start)
    }

    pub fn poll_sleep(&self) -> Duration {
        Duration::from_micros(self.poll_sleep)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_micros(self.settle)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn print(&self) {
        info!("NUMAFLUX_MODE:                 {}", self.mode);
        info!("NUMAFLUX_AUTOSTART:            {}", self.autostart);
        info!("NUMAFLUX_WORKERS:              {:?}", self.workers);
        info!(
            "NUMAFLUX_WEIGHTS:              {}",
            self.weights.as_ref().map_or("(uniform)".into(), |p| p.display().to_string())
        );
        info!("NUMAFLUX_MIN_SEGMENT:          {}", self.min_segment);
        info!("NUMAFLUX_STALL_EVENT:          {:?}", self.stall_event);
    }
}

fn parse_node_list(s: &str) -> std::result::Result<NodeSet, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u32>().map_err(|_| format!("'{}' is not a node id", part)))
        .collect()
}
