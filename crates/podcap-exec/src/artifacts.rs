//! Deterministic artifact naming and glob-based cleanup.
//!
//! ```text
//! <dir>/<prefix>-<job>-<pod>.pcap      first output file
//! <dir>/<prefix>-<job>-<pod>.pcap*     every rotated file of one capture
//! <dir>/<prefix>-<job>-*               every file of one job
//! ```
//!
//! Job names are not escaped against each other: the job-wide pattern of `web` also matches
//! files of a job named `web-api`. Job cleanup therefore skips files of live captures.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use glob::Pattern;
use podcap_model::{JobKey, PodKey};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    dir: PathBuf,
    prefix: String,
}

impl ArtifactLayout {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn output(&self, job: &JobKey, pod: &PodKey) -> PathBuf {
        self.dir
            .join(format!("{}-{}-{}.pcap", self.prefix, job.name(), pod.name()))
    }

    pub fn capture_pattern(&self, job: &JobKey, pod: &PodKey) -> String {
        format!("{}*", escaped(&self.output(job, pod)))
    }

    pub fn job_pattern(&self, job: &JobKey) -> String {
        let stem = self.dir.join(format!("{}-{}-", self.prefix, job.name()));
        format!("{}*", escaped(&stem))
    }

    /// Leading path shared by every artifact; identifies capture processes on the host.
    pub fn owner_marker(&self) -> String {
        self.dir
            .join(format!("{}-", self.prefix))
            .to_string_lossy()
            .into_owned()
    }
}

fn escaped(path: &Path) -> String {
    Pattern::escape(&path.to_string_lossy())
}

fn matches(pattern: &str) -> Vec<PathBuf> {
    match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            warn!(target: "podcap.exec.artifacts", pattern, error = %e, "invalid artifact pattern");
            Vec::new()
        }
    }
}

/// Remove every file matching `pattern` except those matching one of `keep`. Returns the
/// number of files removed.
pub fn remove_matching(pattern: &str, keep: &[String]) -> usize {
    let keep: Vec<Pattern> = keep.iter().filter_map(|p| Pattern::new(p).ok()).collect();
    let mut removed = 0;
    for path in matches(pattern) {
        if keep.iter().any(|k| k.matches_path(&path)) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(target: "podcap.exec.artifacts", file = %path.display(), "removed capture file");
                removed += 1;
            }
            Err(e) => {
                warn!(target: "podcap.exec.artifacts", file = %path.display(), error = %e, "failed to remove capture file");
            }
        }
    }
    removed
}

/// Most recently modified file matching any of `patterns`.
pub fn newest_matching<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Option<PathBuf> {
    patterns
        .into_iter()
        .flat_map(matches)
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by_key(|(modified, _): &(SystemTime, PathBuf)| *modified)
        .map(|(_, path)| path)
}
