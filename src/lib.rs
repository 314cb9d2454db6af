#![forbid(unsafe_code)]

pub mod driver;
pub mod error;
pub mod key;
pub mod orchestrator;
pub mod params;
pub mod planner;
pub mod stage;
pub mod toolkit;

pub use driver::{BatchSummary, RunFailure, run_batch};
pub use error::{SweepError, SweepResult};
pub use key::{ArtifactKey, KeyWriter, Keyed, key_of};
pub use orchestrator::{HeqParams, RunConfig, RunOutcome, RunStats, run_one};
pub use params::{FrameOverrides, FrameParameters, ParameterSequence};
pub use planner::{CameraPath, PlanConfig, load_script, plan};
pub use stage::{
    Artifact, CancelToken, ProcessExecutor, StageExecutor, StageInvocation, StageKind,
};
pub use toolkit::ToolConfig;
