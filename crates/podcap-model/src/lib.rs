//! Public data model of the capture agent.
//!
//! Types here are plain values shared by the reconciler, the process supervisor and the outer
//! surfaces (HTTP, metrics). They carry no behaviour beyond parsing, validation and matching.

mod error;
pub use error::ModelError;

mod domain;
pub use domain::*;

mod selector;
pub use selector::{LabelSelector, LabelSelectorRequirement, Requirement, Selector, SelectorOperator};

mod job;
pub use job::{CaptureJob, JobSpec};
