use std::fmt;

use serde::{Deserialize, Serialize};

/// Aggregate phase of a capture job as reported in its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// No capture is running yet (no matching pods, or waiting for admission).
    Pending,
    /// At least one capture process is active on the owner node.
    Running,
    /// Every capture of the job reached its timeout.
    Completed,
    /// The job definition is unusable (e.g. invalid selector).
    Failed,
}

impl Phase {
    /// Returns `true` if the job will not transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_is_terminal() {
        assert!(Phase::Completed.is_terminal());
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(!Phase::Failed.is_terminal());
    }

    #[test]
    fn serializes_with_resource_casing() {
        let json = serde_json::to_string(&Phase::Running).unwrap();
        assert_eq!(json, r#""Running""#);
    }
}
