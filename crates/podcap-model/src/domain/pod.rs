use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PodKey;

/// Read-only snapshot of a pod as surfaced by the cluster cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
    /// Node the pod is scheduled on; empty while unscheduled.
    #[serde(default)]
    pub node_name: String,
    /// Runtime-qualified container identifiers (`<runtime>://<id>`), in status order.
    ///
    /// Entries may be empty strings for containers that have not started yet.
    #[serde(default)]
    pub container_ids: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = node.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_container(mut self, id: impl Into<String>) -> Self {
        self.container_ids.push(id.into());
        self
    }

    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }

    #[inline]
    pub fn is_on_node(&self, node: &str) -> bool {
        self.node_name == node
    }
}
