//! Kernel OOM killer trigger.

use std::{fs::OpenOptions, io::Write};

const SYSRQ_TRIGGER_PATH: &str = "/proc/sysrq-trigger";

/// Asks the kernel to kill the largest memory consumer, the same as
/// sysrq 'f'. Needs the sysrq interface enabled and root.
pub fn trigger_oom() -> std::io::Result<()> {
    log::debug!("above threshold limit, asking the kernel to kill a task");
    let mut file = OpenOptions::new().write(true).open(SYSRQ_TRIGGER_PATH)?;
    file.write_all(b"f")?;
    Ok(())
}
