//! Kernel pressure-stall trigger registration and readiness.
//!
//! Each severity level gets one trigger written to `/proc/pressure/memory`;
//! the kernel signals `POLLPRI` on the descriptor whenever stall time within
//! the window crosses the threshold.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::fd::AsFd,
    os::unix::fs::OpenOptionsExt,
    sync::Arc,
};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::level::Level;

const MEMORY_PRESSURE_PATH: &str = "/proc/pressure/memory";

/// Whether the trigger counts time where *some* tasks stalled on memory, or
/// only time where *all* of them did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallType {
    Some,
    Full,
}

impl StallType {
    pub fn as_str(self) -> &'static str {
        match self {
            StallType::Some => "some",
            StallType::Full => "full",
        }
    }
}

#[derive(Debug, Error)]
pub enum PsiError {
    /// The pressure file could not be opened: PSI missing from the kernel,
    /// or not enough privileges.
    #[error("could not open /proc/pressure/memory: {0}")]
    Unavailable(#[source] io::Error),
    #[error("kernel rejected trigger {spec:?}: {source}")]
    Rejected { spec: String, source: io::Error },
    #[error("trigger threshold cannot be zero")]
    ZeroThreshold,
    /// The descriptor entered an error state; the watch is dead.
    #[error("pressure watch descriptor failed")]
    Broken,
    #[error("could not poll pressure watch: {0}")]
    Poll(#[source] nix::Error),
}

/// One armed kernel trigger, mapped back to the severity level it was
/// registered for.
#[derive(Debug)]
pub struct PsiTrigger {
    file: Arc<File>,
    level: Level,
}

impl PsiTrigger {
    /// Opens the pressure channel and arms a trigger for `threshold_us` of
    /// `stall` stall time per `window_us` window.
    pub fn register(
        level: Level,
        stall: StallType,
        threshold_us: u32,
        window_us: u32,
    ) -> Result<Self, PsiError> {
        if threshold_us == 0 {
            return Err(PsiError::ZeroThreshold);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(MEMORY_PRESSURE_PATH)
            .map_err(PsiError::Unavailable)?;

        let spec = trigger_spec(stall, threshold_us, window_us);
        // the kernel wants the NUL included
        file.write_all(format!("{}\0", spec).as_bytes())
            .map_err(|source| PsiError::Rejected { spec, source })?;

        Ok(Self {
            file: Arc::new(file),
            level,
        })
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Resolves once the kernel fires this trigger. `Err(Broken)` means the
    /// descriptor is dead and the watch must be dropped.
    pub async fn wait(&self) -> Result<(), PsiError> {
        loop {
            let file = self.file.clone();
            let revents = smol::unblock(move || -> nix::Result<PollFlags> {
                let mut fds = [PollFd::new(
                    file.as_fd(),
                    PollFlags::POLLPRI | PollFlags::POLLERR,
                )];
                poll(&mut fds, PollTimeout::NONE)?;
                Ok(fds[0].revents().unwrap_or(PollFlags::empty()))
            })
            .await;

            match revents {
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(PsiError::Poll(e)),
                Ok(r) if r.contains(PollFlags::POLLERR) => return Err(PsiError::Broken),
                Ok(r) if r.contains(PollFlags::POLLPRI) => return Ok(()),
                Ok(_) => continue,
            }
        }
    }
}

fn trigger_spec(stall: StallType, threshold_us: u32, window_us: u32) -> String {
    format!("{} {} {}", stall.as_str(), threshold_us, window_us)
}
