use std::io;

/// Send `SIGKILL` to the process group led by `pgid`. A group that is already gone is not an error.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> io::Result<()> {
    let pgid = i32::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
    if pgid <= 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pgid <= 1"));
    }

    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

/// Send `SIGKILL` to `pid` alone. A process that is already gone is not an error.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pid <= 1 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid <= 1"));
    }

    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
pub fn kill_process(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "signals require unix"))
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "process groups require unix"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn missing_group_is_ok() {
        // Pids near the top of the range are never handed out on a test host.
        assert!(kill_process_group(i32::MAX as u32 - 1).is_ok());
    }

    #[test]
    fn init_is_refused() {
        assert!(kill_process_group(1).is_err());
        assert!(kill_process_group(0).is_err());
        assert!(kill_process(1).is_err());
    }
}
