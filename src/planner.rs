//! Per-frame parameter planning.
//!
//! Two modes. Sweep mode enumerates integer angles over an inclusive range and
//! merges each into the run defaults. Script mode reads an ordered list of
//! partial overrides where each record inherits from the previous resolved
//! record before falling back to the defaults, so a script only has to name
//! the deltas between consecutive keyframes.

use std::path::Path;

use crate::{
    error::{SweepError, SweepResult},
    params::{FrameOverrides, FrameParameters, ParameterSequence},
};

#[derive(Clone, Debug)]
pub enum CameraPath {
    /// Integer angles, inclusive on both ends.
    Sweep { start: i32, end: i32 },
    /// Ordered cascading keyframe overrides.
    Script(Vec<FrameOverrides>),
}

#[derive(Clone, Debug)]
pub struct PlanConfig {
    pub path: CameraPath,
    /// Keep every Nth frame of the full plan, starting at index 0.
    pub interval: usize,
    pub defaults: FrameParameters,
}

/// Build the ordered frame sequence for one run.
pub fn plan(cfg: &PlanConfig) -> SweepResult<ParameterSequence> {
    if cfg.interval == 0 {
        return Err(SweepError::configuration("frame interval must be >= 1"));
    }

    let full = match &cfg.path {
        CameraPath::Sweep { start, end } => {
            if end < start {
                return Err(SweepError::configuration(format!(
                    "sweep range is empty ({start}..={end})"
                )));
            }
            (*start..=*end)
                .map(|a| FrameParameters {
                    angle: Some(f64::from(a)),
                    eye: None,
                    ..cfg.defaults.clone()
                })
                .collect::<Vec<_>>()
        }
        CameraPath::Script(records) => {
            if records.is_empty() {
                return Err(SweepError::configuration("camera script has no records"));
            }
            let mut accumulated = FrameOverrides::default();
            let mut frames = Vec::with_capacity(records.len());
            for record in records {
                accumulated.overlay(record);
                frames.push(accumulated.resolve(&cfg.defaults));
            }
            frames
        }
    };

    // Integer striding over positions, not filtering by value.
    let sampled = full
        .into_iter()
        .step_by(cfg.interval)
        .collect::<Vec<_>>();

    if sampled.is_empty() {
        return Err(SweepError::configuration(
            "interval sampling produced an empty frame sequence",
        ));
    }

    for frame in &sampled {
        frame.validate()?;
    }

    Ok(ParameterSequence { frames: sampled })
}

/// Read a camera script: a JSON array of partial parameter records.
pub fn load_script(path: &Path) -> SweepResult<Vec<FrameOverrides>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SweepError::configuration(format!(
            "cannot read camera script '{}': {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        SweepError::configuration(format!(
            "cannot parse camera script '{}': {e}",
            path.display()
        ))
    })
}
