use std::thread;
use std::time::Duration;

use log::trace;
use numaflux_io::{CounterBackend, CounterReading};

use crate::error::{CoreError, Result};

/// Turns free-running cycle and stall counters into averaged stall rates.
///
/// There is one estimator per process; it owns the counters and is only
/// ever driven from the controller thread.
pub struct StallRateEstimator {
    counters: Box<dyn CounterBackend>,
    last: CounterReading,
}

impl StallRateEstimator {
    /// Starts the counters and takes the first reference reading.
    pub fn new(mut counters: Box<dyn CounterBackend>) -> Result<Self> {
        counters.start()?;
        let last = counters.read()?;
        Ok(Self { counters, last })
    }

    /// Stalls per cycle since the previous call.
    pub fn sample(&mut self) -> Result<f64> {
        self.counters.stop()?;
        let now = self.counters.read();
        self.counters.start()?;
        let now = now?;

        let cycles = now.cycles.wrapping_sub(self.last.cycles);
        let stalls = now.stalls.wrapping_sub(self.last.stalls);
        self.last = now;

        let rate = if cycles == 0 { 0.0 } else { stalls as f64 / cycles as f64 };
        trace!("stall sample: {} / {} = {:.10}", stalls, cycles, rate);
        Ok(rate)
    }

    /// Mean of `n` samples taken `interval` apart, after discarding the
    /// `trim` smallest and `trim` largest. One warm-up sample is taken and
    /// dropped first.
    pub fn average(&mut self, n: usize, interval: Duration, trim: usize) -> Result<f64> {
        check_trim(n, trim)?;

        self.sample()?;
        thread::sleep(interval);

        let mut samples = Vec::with_capacity(n);
        for _ in 0..n {
            samples.push(self.sample()?);
            thread::sleep(interval);
        }
        trimmed_mean(&mut samples, trim)
    }
}

fn check_trim(n: usize, trim: usize) -> Result<()> {
    if trim.saturating_mul(2) >= n {
        return Err(CoreError::TrimTooLarge { samples: n, trim });
    }
    Ok(())
}

/// Sorts `samples` and averages what remains after removing `trim` values
/// from each end.
pub fn trimmed_mean(samples: &mut [f64], trim: usize) -> Result<f64> {
    check_trim(samples.len(), trim)?;
    samples.sort_by(|a, b| a.total_cmp(b));
    let kept = &samples[trim..samples.len() - trim];
    Ok(kept.iter().sum::<f64>() / kept.len() as f64)
}
