use serde::{Deserialize, Serialize};

use crate::Phase;

/// Observed state of a capture job, written back to the shared job resource.
///
/// `node_name` records which node last wrote the status. Once non-empty, only that node
/// updates the status; writers on other nodes leave it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_location: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

impl JobStatus {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_file_location(mut self, location: impl Into<String>) -> Self {
        self.file_location = location.into();
        self
    }

    pub fn with_owner(mut self, node: impl Into<String>) -> Self {
        self.node_name = node.into();
        self
    }

    #[inline]
    pub fn is_phase(&self, phase: Phase) -> bool {
        self.phase == Some(phase)
    }

    /// Returns `true` if another node has claimed this status.
    pub fn is_owned_by_other(&self, node: &str) -> bool {
        !self.node_name.is_empty() && self.node_name != node
    }
}
