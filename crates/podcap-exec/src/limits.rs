//! rlimits applied to capture processes.
//!
//! Limits are installed in a `pre_exec` hook, so they are in force before the capture
//! binary starts.

use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessLimits {
    /// `RLIMIT_NOFILE`.
    pub max_open_files: Option<u64>,
    /// `RLIMIT_FSIZE`; one rotated output file can never grow past it.
    pub max_file_size_bytes: Option<u64>,
    /// `RLIMIT_CORE = 0`.
    pub disable_core_dumps: bool,
}

impl ProcessLimits {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max_open_files.is_none() && self.max_file_size_bytes.is_none() && !self.disable_core_dumps
    }
}

/// Install `limits` on `cmd`. No-op off unix.
pub fn apply_limits(cmd: &mut Command, limits: &ProcessLimits) {
    if limits.is_empty() {
        return;
    }

    #[cfg(unix)]
    unix::apply(cmd, limits);

    #[cfg(not(unix))]
    tracing::warn!(target: "podcap.exec.limits", ?limits, "process limits are ignored on this platform");
}

#[cfg(unix)]
mod unix {
    use std::io;

    use tokio::process::Command;

    use super::ProcessLimits;

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    type Resource = libc::c_int;

    pub(super) fn apply(cmd: &mut Command, limits: &ProcessLimits) {
        let ProcessLimits {
            max_open_files,
            max_file_size_bytes,
            disable_core_dumps,
        } = limits.clone();

        // SAFETY: the hook only calls `setrlimit`, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(n) = max_open_files {
                    set(libc::RLIMIT_NOFILE, n)?;
                }
                if let Some(n) = max_file_size_bytes {
                    set(libc::RLIMIT_FSIZE, n)?;
                }
                if disable_core_dumps {
                    set(libc::RLIMIT_CORE, 0)?;
                }
                Ok(())
            });
        }
    }

    fn set(resource: Resource, value: u64) -> io::Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        assert!(ProcessLimits::default().is_empty());
        let limits = ProcessLimits {
            disable_core_dumps: true,
            ..Default::default()
        };
        assert!(!limits.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn core_limit_is_visible_in_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "ulimit -c"]);
        apply_limits(
            &mut cmd,
            &ProcessLimits {
                disable_core_dumps: true,
                ..Default::default()
            },
        );
        let out = cmd.output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "0");
    }
}
