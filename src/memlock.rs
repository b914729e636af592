//! Pins the daemon's own pages, so the monitor itself keeps running when
//! the rest of the system is thrashing.

use nix::errno::Errno;

/// Locks current and future mappings. `MCL_ONFAULT` pins pages as they
/// fault in rather than all at once; kernels older than 4.4 reject it with
/// `EINVAL`, which is ignored. Requires `CAP_IPC_LOCK`.
pub fn lock_memory() -> Result<(), Errno> {
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE | libc::MCL_ONFAULT) };
    if ret == 0 {
        return Ok(());
    }
    match Errno::last() {
        Errno::EINVAL => Ok(()),
        errno => Err(errno),
    }
}
