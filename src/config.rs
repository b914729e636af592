//! Command line options and the operator configuration file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use structopt::StructOpt;

/// Compiled-in default for `trigger-kernel-oom`.
const DEFAULT_TRIGGER_KERNEL_OOM: bool = true;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "low-memory-monitor",
    about = "Early low-memory warning daemon"
)]
pub struct Opt {
    /// Path to the configuration file.
    #[structopt(long, default_value = "/etc/low-memory-monitor.conf")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Ask the kernel OOM killer to act when memory pressure turns critical.
    pub trigger_kernel_oom: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trigger_kernel_oom: DEFAULT_TRIGGER_KERNEL_OOM,
        }
    }
}

impl Config {
    /// Loads the configuration, falling back to the compiled-in defaults
    /// when the file is missing or does not parse. Never fatal.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::debug!(
                    "could not read configuration file ({}), using trigger-kernel-oom {}",
                    e,
                    DEFAULT_TRIGGER_KERNEL_OOM
                );
                return Self::default();
            }
        };

        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!(
                    "could not parse {} ({}), using trigger-kernel-oom {}",
                    path.display(),
                    e,
                    DEFAULT_TRIGGER_KERNEL_OOM
                );
                Self::default()
            }
        }
    }
}
