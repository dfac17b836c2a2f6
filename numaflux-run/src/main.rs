use std::env;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use numaflux_core::RuntimeConfig;
use numaflux_io::NumaTopology;

mod config;
mod lifecycle;

use config::Args;
use lifecycle::LifecycleManager;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // 1. Interrogate Hardware
    let topology = NumaTopology::detect();
    topology.print_summary();
    if args.topology {
        return Ok(());
    }

    // 2. Validate the settings the program will see
    for (name, value) in args.environment() {
        env::set_var(name, value);
    }
    let config = RuntimeConfig::from_env().context("Invalid numaflux settings")?;
    topology.validate_workers(&config.workers)?;
    info!("Mode '{}' on workers {:?}", config.mode, config.workers);

    // 3. Launch
    let lifecycle = LifecycleManager::new(&args)?;
    info!("Preloading {}", lifecycle.library().display());
    let mut child = lifecycle.spawn(&args)?;

    let pid = child.id() as libc::pid_t;
    ctrlc::set_handler(move || {
        warn!("Interrupted, forwarding SIGINT to {}", pid);
        // SAFETY: plain signal delivery to our own child.
        unsafe { libc::kill(pid, libc::SIGINT) };
    })
    .context("Error setting Ctrl-C handler")?;

    let status = child.wait().context("Failed to wait for the program")?;
    let code = lifecycle::exit_code(status);
    info!("Program exited with {}", code);
    process::exit(code);
}
