use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use numaflux_core::Mode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a program with adaptive NUMA page placement")]
pub struct Args {
    /// Preload library (defaults to libnumaflux.so next to this binary)
    #[arg(long)]
    pub library: Option<PathBuf>,

    /// Placement strategy
    #[arg(short, long)]
    pub mode: Option<Mode>,

    /// Comma-separated worker node ids
    #[arg(short, long)]
    pub workers: Option<String>,

    /// Node weight file
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Leave starting to the program (numaflux_start)
    #[arg(long)]
    pub manual_start: bool,

    /// Log level inside the program
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Any other option, as NAME=VALUE (e.g. -s NUM_POLLS=40)
    #[arg(short = 's', long = "set", value_parser = parse_setting)]
    pub settings: Vec<(String, String)>,

    /// Print the NUMA topology and exit
    #[arg(long)]
    pub topology: bool,

    /// Program to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required_unless_present = "topology")]
    pub command: Vec<OsString>,
}

impl Args {
    /// `NUMAFLUX_*` variables for the child, later entries winning.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if !self.manual_start {
            vars.push(("NUMAFLUX_AUTOSTART".to_string(), "1".to_string()));
        }
        if let Some(mode) = self.mode {
            vars.push(("NUMAFLUX_MODE".to_string(), mode.to_string()));
        }
        if let Some(workers) = &self.workers {
            vars.push(("NUMAFLUX_WORKERS".to_string(), workers.clone()));
        }
        if let Some(weights) = &self.weights {
            vars.push(("NUMAFLUX_WEIGHTS".to_string(), weights.display().to_string()));
        }
        if let Some(level) = &self.log_level {
            vars.push(("NUMAFLUX_LOGLEVEL".to_string(), level.clone()));
        }
        vars.extend(self.settings.iter().map(|(k, v)| (format!("NUMAFLUX_{}", k), v.clone())));
        vars
    }
}

fn parse_setting(s: &str) -> Result<(String, String)> {
    let Some((name, value)) = s.split_once('=') else {
        bail!("'{}' is not NAME=VALUE", s);
    };
    let name = name.trim().trim_start_matches("NUMAFLUX_").to_ascii_uppercase();
    if name.is_empty() {
        bail!("'{}' has an empty name", s);
    }
    Ok((name, value.to_string()))
}
