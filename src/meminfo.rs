//! The available-memory gate.
//!
//! Kernel pressure triggers can fire on transient stalls that have nothing
//! to do with genuine scarcity, so every trigger event is checked against
//! the global available-memory ratio before it is allowed to change state.

use std::{fs, io, path::Path};

use thiserror::Error;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// At or above this ratio of available memory, low memory signals are not
/// sent.
pub const AVAILABLE_MEM_RATIO: f64 = 0.5;

#[derive(Debug, Error)]
pub enum MeminfoError {
    #[error("could not read /proc/meminfo: {0}")]
    Unreadable(#[from] io::Error),
    #[error("missing or malformed {0} field")]
    MissingField(&'static str),
    #[error("MemTotal is zero")]
    ZeroTotal,
}

/// Returns available/total memory. Units cancel out, so whatever the kernel
/// reports in is fine.
pub fn available_ratio() -> Result<f64, MeminfoError> {
    ratio_from_path(Path::new(MEMINFO_PATH))
}

fn ratio_from_path(path: &Path) -> Result<f64, MeminfoError> {
    parse_ratio(&fs::read_to_string(path)?)
}

fn parse_ratio(contents: &str) -> Result<f64, MeminfoError> {
    let mut lines = contents.lines();
    let total = field(&mut lines, "MemTotal:")?;
    // MemAvailable always sits below MemTotal
    let available = field(&mut lines, "MemAvailable:")?;
    if total == 0 {
        return Err(MeminfoError::ZeroTotal);
    }
    Ok(available as f64 / total as f64)
}

fn field(lines: &mut std::str::Lines, name: &'static str) -> Result<u64, MeminfoError> {
    for line in lines {
        if let Some(rest) = line.strip_prefix(name) {
            return rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or(MeminfoError::MissingField(name));
        }
    }
    Err(MeminfoError::MissingField(name))
}
