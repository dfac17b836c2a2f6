use std::io;
use std::path::PathBuf;

use log::{error, warn};
use numaflux_io::maps::MapsError;
use numaflux_io::platform::topology::TopologyError;
use numaflux_io::{CounterError, NumaError, SymbolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{what} {value:#x} is not a multiple of the page size")]
    Misaligned { what: &'static str, value: usize },
    #[error("ratio {0} is outside [0, 1]")]
    RatioOutOfRange(f64),
    #[error("inconsistent placement arithmetic: {0}")]
    PlacementArithmetic(String),
    #[error("node weights sum to {0}, expected 100")]
    WeightSum(f64),
    #[error("weight table line {line}: {reason}")]
    WeightFormat { line: usize, reason: String },
    #[error("could not identify the {0} segment in the address space")]
    MissingSegment(&'static str),
    #[error("cannot discard {trim} samples from each end of a {samples} sample batch")]
    TrimTooLarge { samples: usize, trim: usize },
    #[error("{0} is not supported by the segment tracker")]
    Unsupported(&'static str),
    #[error("unknown mode '{0}'")]
    UnknownMode(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("the {0} controller has already been started")]
    AlreadyStarted(&'static str),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn the controller thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Counters(#[from] CounterError),
    #[error(transparent)]
    Numa(#[from] NumaError),
    #[error(transparent)]
    Maps(#[from] MapsError),
    #[error(transparent)]
    Symbols(#[from] SymbolError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Everything except a repeated start leaves the address-space view or
    /// the placement state untrustworthy.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CoreError::AlreadyStarted(_))
    }
}

/// The one place errors leave the core: non-fatal kinds are logged and
/// swallowed, everything else terminates the process.
pub fn escalate<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if !e.is_fatal() => {
            warn!("{}", e);
            None
        }
        Err(e) => terminate(&e),
    }
}

pub fn terminate(err: &CoreError) -> ! {
    error!("numaflux: unrecoverable error: {}", err);
    eprintln!("numaflux: unrecoverable error: {}", err);
    std::process::abort()
}
