/// Process termination primitive used by launch units.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Outcome of a successful delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was queued for the process.
    Sent,
    /// No such process: it already exited and was reaped.
    Gone,
}

/// Send `signal` to a single process.
///
/// `ESRCH` is folded into `Delivery::Gone`; every other failure is returned.
/// A pid that does not fit a positive `pid_t` is rejected with `EINVAL`,
/// since 0 and negative values would address whole process groups.
pub fn send(pid: u32, signal: Signal) -> nix::Result<Delivery> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    if raw <= 0 {
        return Err(Errno::EINVAL);
    }
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(Delivery::Sent),
        Err(Errno::ESRCH) => Ok(Delivery::Gone),
        Err(e) => Err(e),
    }
}
