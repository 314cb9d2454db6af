//! Command formatting for the external tools.
//!
//! Three programs are involved: the volume renderer, the image toolkit and the
//! video encoder. Each builder here is pure — it turns parameters into a
//! [`StageInvocation`] and nothing else, so the orchestrator's tests can
//! inspect exact argv contents through the fake executor.

use std::path::{Path, PathBuf};

use crate::{params::FrameParameters, stage::StageInvocation};

/// External program names. Overridable for nonstandard installs and for
/// pointing tests at stand-ins.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ToolConfig {
    pub render: String,
    pub toolkit: String,
    pub encoder: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            render: "mrender".to_string(),
            toolkit: "unu".to_string(),
            encoder: "mencoder".to_string(),
        }
    }
}

fn vec3(v: [f64; 3]) -> Vec<String> {
    v.iter().map(|c| c.to_string()).collect()
}

fn vec2(v: [f64; 2]) -> Vec<String> {
    v.iter().map(|c| c.to_string()).collect()
}

/// Render one frame of the volume.
///
/// The camera is passed either as a sweep angle (`-a`) or an explicit eye
/// position (`-fr`); the planner guarantees one of the two is present.
pub fn render_frame(
    tools: &ToolConfig,
    input: &Path,
    frame: &FrameParameters,
    query: &str,
    measure: &str,
    threads: usize,
    out: &Path,
) -> StageInvocation {
    let mut inv = StageInvocation::new(&tools.render)
        .arg("-i")
        .arg_path(input)
        .args(["-q", query])
        .args(["-m", measure]);

    match (frame.angle, frame.eye) {
        (Some(angle), _) => inv = inv.arg("-a").arg(angle.to_string()),
        (None, Some(eye)) => inv = inv.arg("-fr").args(vec3(eye)),
        (None, None) => {}
    }

    inv = inv
        .arg("-at")
        .args(vec3(frame.at))
        .arg("-up")
        .args(vec3(frame.up));
    if frame.right_handed {
        inv = inv.arg("-rh");
    }
    if frame.at_relative {
        inv = inv.arg("-ar");
    }
    inv.arg("-ur")
        .args(vec2(frame.u_range))
        .arg("-vr")
        .args(vec2(frame.v_range))
        .args(["-dn", &frame.near.to_string()])
        .args(["-df", &frame.far.to_string()])
        .args(["-di", &frame.image_distance.to_string()])
        .args(["-step", &frame.step.to_string()])
        .args(["-k00", &frame.value_kernel])
        .args(["-k11", &frame.derivative_kernel])
        .arg("-is")
        .args([frame.width.to_string(), frame.height.to_string()])
        .args(["-nt", &threads.to_string()])
        .arg("-o")
        .arg_path(out)
}

/// Join N per-frame volumes into one slab along a new axis.
pub fn join_slab(tools: &ToolConfig, inputs: &[PathBuf], axis: u32, out: &Path) -> StageInvocation {
    let mut inv = StageInvocation::new(&tools.toolkit).args(["join", "-i"]);
    for input in inputs {
        inv = inv.arg_path(input);
    }
    inv.args(["-a", &axis.to_string()])
        .arg("-incr")
        .arg("-o")
        .arg_path(out)
}

/// Histogram-equalize a slab with one global mapping.
pub fn equalize(
    tools: &ToolConfig,
    input: &Path,
    bins: u32,
    smoothing: u32,
    out: &Path,
) -> StageInvocation {
    StageInvocation::new(&tools.toolkit)
        .args(["heq", "-i"])
        .arg_path(input)
        .args(["-b", &bins.to_string()])
        .args(["-s", &smoothing.to_string()])
        .arg("-o")
        .arg_path(out)
}

/// Split a slab back into per-frame volumes along `axis`.
///
/// Contract: the toolkit writes slices named `{prefix}{index:03}.nrrd` in
/// ascending index order, index 0 first. The orchestrator renames slice *i*
/// to the keyed artifact name of frame *i*, in sequence order.
pub fn dice(tools: &ToolConfig, input: &Path, axis: u32, prefix: &Path) -> StageInvocation {
    StageInvocation::new(&tools.toolkit)
        .args(["dice", "-i"])
        .arg_path(input)
        .args(["-a", &axis.to_string()])
        .arg("-o")
        .arg_path(prefix)
}

/// Path of the toolkit's `i`th dice slice for a given prefix.
pub fn dice_slice_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("{index:03}.nrrd"));
    PathBuf::from(name)
}

/// Remap values through a colormap file.
pub fn colormap_remap(tools: &ToolConfig, input: &Path, map: &Path, out: &Path) -> StageInvocation {
    StageInvocation::new(&tools.toolkit)
        .args(["rmap", "-i"])
        .arg_path(input)
        .arg("-m")
        .arg_path(map)
        .arg("-o")
        .arg_path(out)
}

/// Report a volume's min/max (and non-finite presence) on stdout.
pub fn minmax(tools: &ToolConfig, input: &Path) -> StageInvocation {
    StageInvocation::new(&tools.toolkit)
        .arg("minmax")
        .arg_path(input)
}

/// Replace non-finite samples with zero.
pub fn nan_strip(tools: &ToolConfig, input: &Path, out: &Path) -> StageInvocation {
    StageInvocation::new(&tools.toolkit)
        .args(["2op", "exists"])
        .arg_path(input)
        .arg("0")
        .arg("-o")
        .arg_path(out)
}

/// Quantize a volume to an 8-bit image against a global range.
pub fn quantize(
    tools: &ToolConfig,
    input: &Path,
    min: f64,
    max: f64,
    out: &Path,
) -> StageInvocation {
    StageInvocation::new(&tools.toolkit)
        .args(["quantize", "-b", "8"])
        .args(["-min", &min.to_string()])
        .args(["-max", &max.to_string()])
        .arg("-i")
        .arg_path(input)
        .arg("-o")
        .arg_path(out)
}

/// Empirical bitrate heuristic balancing quality against size. A tunable, not
/// a law.
pub fn video_bitrate(width: u32, height: u32) -> u64 {
    60 * 25 * u64::from(width) * u64::from(height) / 256
}

/// Encode a manifest of image paths (one per line, frame order) into a video.
pub fn encode(
    tools: &ToolConfig,
    manifest: &Path,
    width: u32,
    height: u32,
    fps: u32,
    out: &Path,
) -> StageInvocation {
    let bitrate = video_bitrate(width, height);
    StageInvocation::new(&tools.encoder)
        .arg(format!("mf://@{}", manifest.display()))
        .arg("-mf")
        .arg(format!("w={width}:h={height}:fps={fps}:type=png"))
        .args(["-ovc", "lavc"])
        .arg("-lavcopts")
        .arg(format!("vcodec=mpeg4:vbitrate={bitrate}"))
        .arg("-nosound")
        .arg("-o")
        .arg_path(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::FrameParameters;

    #[test]
    fn render_uses_angle_when_sweeping_and_eye_otherwise() {
        let tools = ToolConfig::default();
        let mut frame = FrameParameters {
            angle: Some(30.0),
            ..FrameParameters::default()
        };
        let inv = render_frame(
            &tools,
            Path::new("vol.nrrd"),
            &frame,
            "val",
            "max",
            4,
            Path::new("out.nrrd"),
        );
        let line = inv.command_line();
        assert!(line.contains("-a 30"));
        assert!(!line.contains("-fr"));
        assert!(line.contains("-q val"));
        assert!(line.contains("-m max"));
        assert!(line.contains("-nt 4"));

        frame.angle = None;
        frame.eye = Some([3.0, 0.0, 0.0]);
        let inv = render_frame(
            &tools,
            Path::new("vol.nrrd"),
            &frame,
            "val",
            "max",
            4,
            Path::new("out.nrrd"),
        );
        let line = inv.command_line();
        assert!(line.contains("-fr 3 0 0"));
        assert!(!line.contains("-a 3 "));
    }

    #[test]
    fn dice_slice_paths_are_zero_padded_in_order() {
        let prefix = Path::new("/tmp/run/slice-");
        assert_eq!(
            dice_slice_path(prefix, 0),
            PathBuf::from("/tmp/run/slice-000.nrrd")
        );
        assert_eq!(
            dice_slice_path(prefix, 42),
            PathBuf::from("/tmp/run/slice-042.nrrd")
        );
    }

    #[test]
    fn bitrate_heuristic_matches_documented_constant() {
        assert_eq!(video_bitrate(512, 512), 60 * 25 * 512 * 512 / 256);
    }

    #[test]
    fn encode_points_at_the_manifest() {
        let inv = encode(
            &ToolConfig::default(),
            Path::new("frames.txt"),
            640,
            480,
            25,
            Path::new("out.avi"),
        );
        assert_eq!(inv.program, "mencoder");
        assert!(inv.args[0].starts_with("mf://@frames.txt"));
        assert!(inv.command_line().contains("w=640:h=480:fps=25"));
    }
}
