//! Recovery of capture processes left behind by a previous agent run.
//!
//! Capture processes are group leaders whose command line names an output file under the
//! capture directory, so they can be found by scanning `/proc` for that marker.

use std::{io, path::Path};

use tracing::{debug, info, warn};

use crate::{kill_process, kill_process_group};

/// PIDs of processes whose command line carries an argument starting with `marker`.
pub fn find_orphans(proc_root: &Path, marker: &str) -> Vec<u32> {
    let own = std::process::id();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut pids: Vec<u32> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| {
            std::fs::read(proc_root.join(pid.to_string()).join("cmdline"))
                .is_ok_and(|raw| references(&raw, marker))
        })
        .collect();
    pids.sort_unstable();
    pids
}

fn references(cmdline: &[u8], marker: &str) -> bool {
    cmdline
        .split(|b| *b == 0)
        .any(|arg| arg.starts_with(marker.as_bytes()))
}

/// Process group of `pid`, read from the fields after the command name in `stat`.
pub fn process_group(proc_root: &Path, pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    // state ppid pgrp ...
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// Kill the group `pid` leads, or `pid` alone when it is not a group leader.
fn kill_orphan(proc_root: &Path, pid: u32) -> io::Result<()> {
    if process_group(proc_root, pid) == Some(pid) {
        kill_process_group(pid)
    } else {
        debug!(target: "podcap.exec.orphan", pid, "orphan is not a group leader; killing it alone");
        kill_process(pid)
    }
}

/// Kill every orphaned capture process. Returns how many were signalled.
pub fn reap_orphans(marker: &str) -> usize {
    let proc_root = Path::new("/proc");
    let mut reaped = 0;
    for pid in find_orphans(proc_root, marker) {
        match kill_orphan(proc_root, pid) {
            Ok(()) => {
                info!(target: "podcap.exec.orphan", pid, "killed orphaned capture process");
                reaped += 1;
            }
            Err(e) => {
                warn!(target: "podcap.exec.orphan", pid, error = %e, "failed to kill orphaned capture process");
            }
        }
    }
    reaped
}
