use podcap_model::PodIdentity;

/// Chooses which container of a pod gets captured.
pub trait ContainerPolicy: Send + Sync + 'static {
    /// Runtime-qualified container id, or `None` while the pod has no usable container yet.
    fn select(&self, pod: &PodIdentity) -> Option<String>;
}

/// Capture the first container listed in the pod status.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstContainer;

impl ContainerPolicy for FirstContainer {
    fn select(&self, pod: &PodIdentity) -> Option<String> {
        pod.container_ids
            .first()
            .filter(|id| !id.is_empty())
            .cloned()
    }
}
