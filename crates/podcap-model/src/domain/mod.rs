mod keys;
pub use keys::{JobKey, PodKey};

mod phase;
pub use phase::Phase;

mod status;
pub use status::JobStatus;

mod pod;
pub use pod::PodIdentity;

mod container;
pub use container::{ContainerRef, ContainerRuntime};

mod constants;
pub use constants::{ANNOTATION_CAPTURE_FILES, ANNOTATED_JOB_NAME};

/// Timeout value in milliseconds.
///
/// Zero means "no timeout".
pub type TimeoutMs = u64;
