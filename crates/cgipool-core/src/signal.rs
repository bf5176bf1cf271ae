//! Process and process-group signalling.
//!
//! Workers and supervised processes are launched as leaders of their own
//! process group (`pgid == pid`), so signalling the group reaches every
//! descendant a CGI handler or interpreter may have forked.

pub use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;

pub use nix::sys::signal::Signal;

fn pid_of(pid: u32) -> Result<Pid, Errno> {
    i32::try_from(pid).map(Pid::from_raw).map_err(|_| Errno::EINVAL)
}

/// Send `sig` to the process group led by `pid`.
pub fn signal_group(pid: u32, sig: Signal) -> Result<(), Errno> {
    signal::killpg(pid_of(pid)?, sig)
}

/// Send `sig` to the single process `pid`.
pub fn signal_process(pid: u32, sig: Signal) -> Result<(), Errno> {
    signal::kill(pid_of(pid)?, sig)
}

/// Whether `pid` still exists. A process we may not signal still exists.
pub fn is_alive(pid: u32) -> bool {
    match pid_of(pid).and_then(|p| signal::kill(p, None)) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The process group of `pid`, if it can be read.
pub fn process_group(pid: u32) -> Option<u32> {
    let pgid = nix::unistd::getpgid(Some(pid_of(pid).ok()?)).ok()?;
    u32::try_from(pgid.as_raw()).ok()
}
