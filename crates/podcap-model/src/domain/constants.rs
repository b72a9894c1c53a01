/// Pod annotation that requests a capture directly, without a job resource.
///
/// The value is the number of rotated files to keep and must be a positive integer.
pub const ANNOTATION_CAPTURE_FILES: &str = "podcap.io/capture-files";

/// Job name used for artifacts of annotation-driven captures.
pub const ANNOTATED_JOB_NAME: &str = "annotated";
