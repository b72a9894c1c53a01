use std::{path::PathBuf, time::Duration};

use crate::{ExecError, ExecResult, ProcessLimits};

/// Static configuration of a [`CaptureSupervisor`](crate::CaptureSupervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory holding every capture artifact.
    pub capture_dir: PathBuf,
    /// File name prefix; artifacts are named `<prefix>-<job>-<pod>.pcap`.
    pub file_prefix: String,
    /// Admission pool size: live capture processes never exceed it.
    pub max_concurrent: usize,
    /// Rotation size of one output file.
    pub chunk_size_mb: u32,
    /// Interface captured inside the pod network namespace.
    pub interface: String,
    /// How long a stop waits for the exit observer after killing the process group.
    pub join_timeout: Duration,
    /// Kill leftover capture processes of a previous agent run at start-up.
    pub reap_orphans: bool,
    pub limits: ProcessLimits,
}

impl SupervisorConfig {
    pub fn new(capture_dir: impl Into<PathBuf>) -> Self {
        Self {
            capture_dir: capture_dir.into(),
            file_prefix: "capture".into(),
            max_concurrent: 5,
            chunk_size_mb: 1,
            interface: "eth0".into(),
            join_timeout: Duration::from_secs(5),
            reap_orphans: true,
            limits: ProcessLimits {
                disable_core_dumps: true,
                ..ProcessLimits::default()
            },
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn validate(&self) -> ExecResult<()> {
        if self.max_concurrent == 0 {
            return Err(ExecError::InvalidConfig("max_concurrent must be > 0".into()));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains('/') {
            return Err(ExecError::InvalidConfig(format!(
                "invalid file prefix {:?}",
                self.file_prefix
            )));
        }
        if self.chunk_size_mb == 0 {
            return Err(ExecError::InvalidConfig("chunk_size_mb must be > 0".into()));
        }
        Ok(())
    }
}
