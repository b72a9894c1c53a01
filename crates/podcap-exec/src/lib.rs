//! Process side of the capture agent: admission-controlled supervision of packet-capture
//! processes running inside pod network namespaces.

mod error;
pub use error::{ExecError, ExecResult};

mod config;
pub use config::SupervisorConfig;

mod admission;

pub mod artifacts;
pub use artifacts::ArtifactLayout;

pub mod launch;
pub use launch::{CaptureLauncher, LaunchSpec, NsenterTcpdump, TemplateLauncher};

pub mod limits;
pub use limits::ProcessLimits;

pub mod orphan;

pub mod resolve;
pub use resolve::{CriResolver, FixedResolver, PidResolver};

mod supervisor;
pub use supervisor::CaptureSupervisor;

mod util;
pub use util::{kill_process, kill_process_group};
