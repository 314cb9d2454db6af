use crate::error::{SweepError, SweepResult};

/// One frame's full render configuration. Immutable once constructed; the
/// planner is the only producer.
///
/// The camera is either an azimuthal sweep `angle` (degrees) or an explicit
/// `eye` position. Exactly one of the two should be set; [`validate`]
/// (Self::validate) enforces this.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FrameParameters {
    pub angle: Option<f64>,    // sweep camera, degrees about the up axis
    pub eye: Option<[f64; 3]>, // explicit camera position (script mode)
    pub at: [f64; 3],
    pub up: [f64; 3],
    pub right_handed: bool,
    pub at_relative: bool, // eye/clip distances measured relative to `at`
    pub u_range: [f64; 2],
    pub v_range: [f64; 2],
    pub near: f64,
    pub far: f64,
    pub image_distance: f64,
    pub step: f64, // ray sampling step
    pub value_kernel: String,
    pub derivative_kernel: String,
    pub width: u32,
    pub height: u32,
}

impl FrameParameters {
    pub fn validate(&self) -> SweepResult<()> {
        if self.angle.is_none() && self.eye.is_none() {
            return Err(SweepError::configuration(
                "frame has neither a sweep angle nor an explicit eye position",
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(SweepError::configuration(
                "frame resolution must be non-zero",
            ));
        }
        if self.step <= 0.0 {
            return Err(SweepError::configuration("sampling step must be positive"));
        }
        Ok(())
    }
}

impl Default for FrameParameters {
    fn default() -> Self {
        Self {
            angle: None,
            eye: None,
            at: [0.0, 0.0, 0.0],
            up: [0.0, 0.0, 1.0],
            right_handed: true,
            at_relative: true,
            u_range: [-1.0, 1.0],
            v_range: [-1.0, 1.0],
            near: -1.0,
            far: 1.0,
            image_distance: 2.0,
            step: 0.005,
            value_kernel: "tent".to_string(),
            derivative_kernel: "cubicd:1,0".to_string(),
            width: 512,
            height: 512,
        }
    }
}

/// Partial form of [`FrameParameters`] as it appears in camera scripts: every
/// field optional, unknown fields rejected so typos fail loudly.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameOverrides {
    pub angle: Option<f64>,
    pub eye: Option<[f64; 3]>,
    pub at: Option<[f64; 3]>,
    pub up: Option<[f64; 3]>,
    pub right_handed: Option<bool>,
    pub at_relative: Option<bool>,
    pub u_range: Option<[f64; 2]>,
    pub v_range: Option<[f64; 2]>,
    pub near: Option<f64>,
    pub far: Option<f64>,
    pub image_distance: Option<f64>,
    pub step: Option<f64>,
    pub value_kernel: Option<String>,
    pub derivative_kernel: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl FrameOverrides {
    /// Overlay `later` on top of `self`: fields set in `later` win.
    pub fn overlay(&mut self, later: &FrameOverrides) {
        macro_rules! take {
            ($field:ident) => {
                if later.$field.is_some() {
                    self.$field = later.$field.clone();
                }
            };
        }
        take!(angle);
        take!(eye);
        take!(at);
        take!(up);
        take!(right_handed);
        take!(at_relative);
        take!(u_range);
        take!(v_range);
        take!(near);
        take!(far);
        take!(image_distance);
        take!(step);
        take!(value_kernel);
        take!(derivative_kernel);
        take!(width);
        take!(height);
    }

    /// Fill every unset field from `defaults`.
    pub fn resolve(&self, defaults: &FrameParameters) -> FrameParameters {
        FrameParameters {
            angle: self.angle.or(defaults.angle),
            eye: self.eye.or(defaults.eye),
            at: self.at.unwrap_or(defaults.at),
            up: self.up.unwrap_or(defaults.up),
            right_handed: self.right_handed.unwrap_or(defaults.right_handed),
            at_relative: self.at_relative.unwrap_or(defaults.at_relative),
            u_range: self.u_range.unwrap_or(defaults.u_range),
            v_range: self.v_range.unwrap_or(defaults.v_range),
            near: self.near.unwrap_or(defaults.near),
            far: self.far.unwrap_or(defaults.far),
            image_distance: self.image_distance.unwrap_or(defaults.image_distance),
            step: self.step.unwrap_or(defaults.step),
            value_kernel: self
                .value_kernel
                .clone()
                .unwrap_or_else(|| defaults.value_kernel.clone()),
            derivative_kernel: self
                .derivative_kernel
                .clone()
                .unwrap_or_else(|| defaults.derivative_kernel.clone()),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
        }
    }
}

/// Ordered list of frame parameters for one (query, measure) run.
///
/// The order is video frame order and must be stable across reruns for the
/// artifact cache to be effective. Non-empty by construction (the planner
/// rejects empty plans).
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSequence {
    pub frames: Vec<FrameParameters>,
}

impl ParameterSequence {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FrameParameters> {
        self.frames.iter()
    }
}
