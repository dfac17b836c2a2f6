use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::os::unix::process::ExitStatusExt;

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::config::Args;

const LIBRARY_NAME: &str = "libnumaflux.so";

/// Runs the target program with the preload library injected.
pub struct LifecycleManager {
    library: PathBuf,
}

impl LifecycleManager {
    pub fn new(args: &Args) -> Result<Self> {
        let library = match &args.library {
            Some(path) => path.clone(),
            None => default_library()?,
        };
        if !library.is_file() {
            bail!("Preload library {} not found (use --library)", library.display());
        }
        let library = library
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", library.display()))?;
        Ok(Self { library })
    }

    pub fn library(&self) -> &Path {
        &self.library
    }

    /// `LD_PRELOAD` with the library in front of whatever was already set.
    pub fn preload_value(&self, existing: Option<&str>) -> String {
        match existing {
            Some(rest) if !rest.is_empty() => format!("{}:{}", self.library.display(), rest),
            _ => self.library.display().to_string(),
        }
    }

    pub fn spawn(&self, args: &Args) -> Result<Child> {
        let (program, rest) = args.command.split_first().context("No program given")?;

        let mut command = Command::new(program);
        command.args(rest);
        let preload = self.preload_value(env::var("LD_PRELOAD").ok().as_deref());
        debug!("LD_PRELOAD={}", preload);
        command.env("LD_PRELOAD", preload);
        for (name, value) in args.environment() {
            debug!("{}={}", name, value);
            command.env(name, value);
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.to_string_lossy()))?;
        info!("Started {} (pid {})", program.to_string_lossy(), child.id());
        Ok(child)
    }
}

fn default_library() -> Result<PathBuf> {
    let exe = env::current_exe().context("Failed to locate numaflux-run")?;
    let dir = exe.parent().context("numaflux-run has no parent directory")?;
    Ok(dir.join(LIBRARY_NAME))
}

/// Shell-style exit code: the child's own code, or 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preload_goes_first() {
        let manager = LifecycleManager { library: PathBuf::from("/opt/numaflux/libnumaflux.so") };
        assert_eq!(manager.preload_value(None), "/opt/numaflux/libnumaflux.so");
        assert_eq!(manager.preload_value(Some("")), "/opt/numaflux/libnumaflux.so");
        assert_eq!(manager.preload_value(Some("libfoo.so")), "/opt/numaflux/libnumaflux.so:libfoo.so");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 128 + libc::SIGKILL);
    }
}
